//! Selection of the product variant for a set of telemetry identifiers.
//!
//! A [Registry] is an explicit table of [Registration]s built once and handed to whatever
//! constructs products (see [ProductFactory](crate::io::ProductFactory)). Each registration
//! pairs a predicate with a constructor. Exactly one predicate may match; ambiguous tables are
//! reported as [Error::MultipleMatch] rather than resolved.
use tracing::trace;

use super::kind::{HkReport, ProductKind, QlProduct, ScienceProduct};
use super::{Control, Data, Energies, Level};
use crate::{Error, Result};

/// Attributes a product variant is selected by.
#[derive(Debug, Clone, Copy)]
pub struct Selector<'a> {
    pub level: Level,
    pub service_type: u8,
    pub service_subtype: u8,
    pub ssid: Option<u8>,
    pub control: Option<&'a Control>,
    pub data: Option<&'a Data>,
    pub energies: Option<&'a Energies>,
}

impl<'a> Selector<'a> {
    #[must_use]
    pub fn new(level: Level, service_type: u8, service_subtype: u8, ssid: Option<u8>) -> Self {
        Self {
            level,
            service_type,
            service_subtype,
            ssid,
            control: None,
            data: None,
            energies: None,
        }
    }

    #[must_use]
    pub fn with_tables(mut self, control: &'a Control, data: &'a Data) -> Self {
        self.control = Some(control);
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_energies(mut self, energies: Option<&'a Energies>) -> Self {
        self.energies = energies;
        self
    }

    fn is_service(&self, service_type: u8, service_subtype: u8) -> bool {
        self.service_type == service_type && self.service_subtype == service_subtype
    }
}

/// A predicate/constructor pair for one product variant family.
#[derive(Clone, Copy)]
pub struct Registration {
    pub name: &'static str,
    pub matches: fn(&Selector) -> bool,
    pub build: fn(&Selector) -> ProductKind,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<Registration>,
    default: Option<Registration>,
}

impl Registry {
    /// An empty registry with no default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(
        mut self,
        name: &'static str,
        matches: fn(&Selector) -> bool,
        build: fn(&Selector) -> ProductKind,
    ) -> Self {
        self.entries.push(Registration {
            name,
            matches,
            build,
        });
        self
    }

    /// Variant to use when no registered predicate matches.
    #[must_use]
    pub fn with_default(mut self, name: &'static str, build: fn(&Selector) -> ProductKind) -> Self {
        self.default = Some(Registration {
            name,
            matches: |_| true,
            build,
        });
        self
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|r| r.name).collect()
    }

    /// The registry of all known product variants with [ProductKind::Generic] as default.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .register("LevelBinary", |s| s.level == Level::LB, build_level_binary)
            .register(
                "Housekeeping",
                |s| {
                    is_processed(s.level)
                        && s.is_service(3, 25)
                        && s.ssid.and_then(HkReport::from_ssid).is_some()
                },
                |s| {
                    ProductKind::Housekeeping(
                        s.ssid.and_then(HkReport::from_ssid).unwrap_or(HkReport::Mini),
                    )
                },
            )
            .register(
                "QuickLook",
                |s| {
                    (is_processed(s.level) || s.level == Level::LL01)
                        && s.is_service(21, 6)
                        && s.ssid.and_then(QlProduct::from_ssid).is_some()
                },
                |s| {
                    ProductKind::QuickLook(
                        s.ssid
                            .and_then(QlProduct::from_ssid)
                            .unwrap_or(QlProduct::LightCurve),
                    )
                },
            )
            .register(
                "Science",
                |s| {
                    is_processed(s.level)
                        && s.is_service(21, 6)
                        && s.ssid.and_then(ScienceProduct::from_ssid).is_some()
                },
                |s| {
                    ProductKind::Science(
                        s.ssid
                            .and_then(ScienceProduct::from_ssid)
                            .unwrap_or(ScienceProduct::RawPixelData),
                    )
                },
            )
            .with_default("Generic", |s| ProductKind::Generic {
                service_type: s.service_type,
                service_subtype: s.service_subtype,
                ssid: s.ssid,
            })
    }

    /// Select the variant for `selector`.
    ///
    /// # Errors
    /// [Error::NoMatch] if nothing matches and there is no default, [Error::MultipleMatch] if
    /// more than one registration matches.
    pub fn dispatch(&self, selector: &Selector) -> Result<ProductKind> {
        let candidates: Vec<&Registration> = self
            .entries
            .iter()
            .filter(|r| (r.matches)(selector))
            .collect();

        let registration = match candidates.len() {
            0 => match &self.default {
                Some(default) => default,
                None => {
                    return Err(Error::NoMatch(format!(
                        "level={} stype={} sstype={} ssid={:?}",
                        selector.level,
                        selector.service_type,
                        selector.service_subtype,
                        selector.ssid
                    )))
                }
            },
            1 => candidates[0],
            count => {
                return Err(Error::MultipleMatch {
                    count,
                    names: candidates.iter().map(|r| r.name.to_string()).collect(),
                })
            }
        };
        trace!(
            registration = registration.name,
            level = %selector.level,
            stype = selector.service_type,
            sstype = selector.service_subtype,
            "dispatched"
        );
        Ok((registration.build)(selector))
    }
}

fn is_processed(level: Level) -> bool {
    matches!(level, Level::L0 | Level::L1 | Level::L2)
}

fn build_level_binary(s: &Selector) -> ProductKind {
    ProductKind::LevelBinary {
        service_type: s.service_type,
        service_subtype: s.service_subtype,
        ssid: s.ssid,
    }
}
