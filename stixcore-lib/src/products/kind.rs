use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::Level;

/// Housekeeping reports, service 3 subtype 25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HkReport {
    Mini,
    Maxi,
}

impl HkReport {
    #[must_use]
    pub fn from_ssid(ssid: u8) -> Option<Self> {
        match ssid {
            1 => Some(Self::Mini),
            2 => Some(Self::Maxi),
            _ => None,
        }
    }

    #[must_use]
    pub fn ssid(&self) -> u8 {
        match self {
            Self::Mini => 1,
            Self::Maxi => 2,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mini => "mini",
            Self::Maxi => "maxi",
        }
    }
}

/// Quick look products, service 21 subtype 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QlProduct {
    LightCurve,
    Background,
    Spectra,
    Variance,
    FlareFlag,
}

impl QlProduct {
    #[must_use]
    pub fn from_ssid(ssid: u8) -> Option<Self> {
        match ssid {
            30 => Some(Self::LightCurve),
            31 => Some(Self::Background),
            32 => Some(Self::Spectra),
            33 => Some(Self::Variance),
            34 => Some(Self::FlareFlag),
            _ => None,
        }
    }

    #[must_use]
    pub fn ssid(&self) -> u8 {
        match self {
            Self::LightCurve => 30,
            Self::Background => 31,
            Self::Spectra => 32,
            Self::Variance => 33,
            Self::FlareFlag => 34,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::LightCurve => "lightcurve",
            Self::Background => "background",
            Self::Spectra => "spectra",
            Self::Variance => "variance",
            Self::FlareFlag => "flareflag",
        }
    }
}

/// Science data by request, service 21 subtype 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScienceProduct {
    RawPixelData,
    CompressedPixelData,
    SummedPixelData,
    Visibility,
    Spectrogram,
    Aspect,
}

impl ScienceProduct {
    #[must_use]
    pub fn from_ssid(ssid: u8) -> Option<Self> {
        match ssid {
            20 => Some(Self::RawPixelData),
            21 => Some(Self::CompressedPixelData),
            22 => Some(Self::SummedPixelData),
            23 => Some(Self::Visibility),
            24 => Some(Self::Spectrogram),
            42 => Some(Self::Aspect),
            _ => None,
        }
    }

    #[must_use]
    pub fn ssid(&self) -> u8 {
        match self {
            Self::RawPixelData => 20,
            Self::CompressedPixelData => 21,
            Self::SummedPixelData => 22,
            Self::Visibility => 23,
            Self::Spectrogram => 24,
            Self::Aspect => 42,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RawPixelData => "xray-rpd",
            Self::CompressedPixelData => "xray-cpd",
            Self::SummedPixelData => "xray-scpd",
            Self::Visibility => "xray-visibility",
            Self::Spectrogram => "xray-spectrogram",
            Self::Aspect => "burst-aspect",
        }
    }
}

/// Name of a PUS service used for products without a dedicated variant.
#[must_use]
pub fn service_name(service_type: u8) -> &'static str {
    match service_type {
        1 => "tc-verify",
        5 => "events",
        6 => "memory",
        9 => "time",
        17 => "conn-test",
        20 => "info-dist",
        22 => "context",
        236 => "config",
        237 => "params",
        238 => "archive",
        239 => "diagnostics",
        _ => "unknown",
    }
}

/// The concrete kind of a product. Two products can only be combined if their kinds are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductKind {
    /// Undecoded packets of one `(service_type, service_subtype, ssid)` key.
    LevelBinary {
        service_type: u8,
        service_subtype: u8,
        ssid: Option<u8>,
    },
    Housekeeping(HkReport),
    QuickLook(QlProduct),
    Science(ScienceProduct),
    /// Default for anything without a dedicated variant.
    Generic {
        service_type: u8,
        service_subtype: u8,
        ssid: Option<u8>,
    },
}

impl ProductKind {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::LevelBinary {
                service_type,
                service_subtype,
                ssid,
            } => match ssid {
                Some(ssid) => format!("{service_type}-{service_subtype}-{ssid}"),
                None => format!("{service_type}-{service_subtype}"),
            },
            Self::Housekeeping(hk) => hk.name().to_string(),
            Self::QuickLook(ql) => ql.name().to_string(),
            Self::Science(sci) => sci.name().to_string(),
            Self::Generic {
                service_subtype,
                ssid,
                ..
            } => match ssid {
                Some(ssid) if *ssid != 0 => format!("{service_subtype}-{ssid}"),
                _ => format!("{service_subtype}"),
            },
        }
    }

    #[must_use]
    pub fn product_type(&self) -> &'static str {
        match self {
            Self::LevelBinary { .. } => "lb",
            Self::Housekeeping(_) => "hk",
            Self::QuickLook(_) => "ql",
            Self::Science(_) => "sci",
            Self::Generic { service_type, .. } => service_name(*service_type),
        }
    }

    /// Levels a product of this kind can exist at.
    #[must_use]
    pub fn supports(&self, level: Level) -> bool {
        match self {
            Self::LevelBinary { .. } => level == Level::LB,
            Self::QuickLook(QlProduct::LightCurve | QlProduct::FlareFlag) => {
                matches!(level, Level::L0 | Level::L1 | Level::L2 | Level::LL01)
            }
            _ => matches!(level, Level::L0 | Level::L1 | Level::L2),
        }
    }

    /// Whether an L1 product can be derived from an L0 product of this kind.
    #[must_use]
    pub fn can_derive_l1(&self) -> bool {
        self.supports(Level::L0) && self.supports(Level::L1)
    }

    /// Whether an L2 product can be derived from an L1 product of this kind.
    #[must_use]
    pub fn can_derive_l2(&self) -> bool {
        self.supports(Level::L1) && self.supports(Level::L2)
    }
}

impl Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.product_type(), self.name())
    }
}
