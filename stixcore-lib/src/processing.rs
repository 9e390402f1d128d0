//! Packet decoding and calibration collaborators used by the level transitions.
//!
//! [Product::to_level0](crate::products::Product::to_level0) runs each level binary packet
//! through a [PacketDecoder], a [Decompressor] and the packet stage of an
//! [EngineeringCalibrator]; [Product::to_level1](crate::products::Product::to_level1) applies
//! the product stage of the calibrator. The implementations here are driven by an [Idb].
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;
use typed_builder::TypedBuilder;

use crate::idb::Idb;
use crate::products::table::{Column, ParamMeta, Values};
use crate::products::{PacketPolicy, Product, Registry};
use crate::time::ScetTime;
use crate::tmtc::{DataHeader, TmPacket};
use crate::{Error, Result};

/// A parameter read from the application data of a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub nix: String,
    pub name: String,
    pub raw: Vec<u64>,
    /// Engineering values, once calibrated.
    pub eng: Option<Vec<f64>>,
    pub curtx: Option<String>,
    pub unit: Option<String>,
}

impl Parameter {
    /// Number of values, more than one for array parameters.
    #[must_use]
    pub fn count(&self) -> usize {
        self.raw.len()
    }

    /// Engineering values if calibrated, raw values otherwise.
    #[must_use]
    pub fn values(&self) -> Values {
        match &self.eng {
            Some(eng) => Values::F64(eng.clone()),
            None => Values::U64(self.raw.clone()),
        }
    }
}

/// A packet with its application data split into parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub data_header: DataHeader,
    pub ssid: Option<u8>,
    pub sequence_count: u16,
    /// Label of the IDB version used for decoding.
    pub idb_version: String,
    pub parameters: Vec<Parameter>,
}

impl DecodedPacket {
    /// Packet time with the synchronization flag removed.
    #[must_use]
    pub fn scet(&self) -> ScetTime {
        ScetTime::new(
            self.data_header.scet_coarse & !crate::time::UNSYNCED_FLAG,
            self.data_header.scet_fine,
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// First raw value of parameter `name`.
    #[must_use]
    pub fn raw_value(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|p| p.raw.first().copied())
    }
}

/// Splits packet bytes into parameters.
pub trait PacketDecoder: Send + Sync {
    /// # Errors
    /// [Error::Decode] if the packet is malformed or of an unknown type.
    fn decode(&self, packet: &TmPacket) -> Result<DecodedPacket>;
}

/// Expands compressed parameter values in place.
pub trait Decompressor: Send + Sync {
    /// # Errors
    /// [Error::Decode] if a value cannot be decompressed.
    fn decompress(&self, packet: &mut DecodedPacket) -> Result<()>;
}

/// Raw to engineering conversion.
pub trait EngineeringCalibrator: Send + Sync {
    /// Calibrate the parameters of a single packet.
    ///
    /// # Errors
    /// If a parameter cannot be calibrated.
    fn calibrate_packet(&self, packet: &mut DecodedPacket) -> Result<()>;

    /// Calibrate the columns of a whole product.
    ///
    /// # Errors
    /// If a column cannot be calibrated.
    fn calibrate_product(&self, product: &mut Product) -> Result<()>;
}

/// Reads values most significant bit first.
struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read(&mut self, bits: u8) -> Option<u64> {
        let bits = usize::from(bits);
        if bits == 0 || bits > 64 || self.pos + bits > self.buf.len() * 8 {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.buf[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        Some(value)
    }
}

/// Decodes application data with the packet layouts of one IDB version.
#[derive(Debug, Clone)]
pub struct LayoutDecoder {
    idb: Arc<Idb>,
}

impl LayoutDecoder {
    #[must_use]
    pub fn new(idb: Arc<Idb>) -> Self {
        Self { idb }
    }
}

impl PacketDecoder for LayoutDecoder {
    fn decode(&self, packet: &TmPacket) -> Result<DecodedPacket> {
        let (service_type, service_subtype, ssid) = packet.key();
        let Some(layout) = self.idb.layout(service_type, service_subtype, ssid) else {
            return Err(Error::Decode(format!(
                "no layout for {service_type}/{service_subtype}/{ssid:?} in IDB {}",
                self.idb.version
            )));
        };

        let mut reader = BitReader::new(packet.app_data());
        let mut parameters = Vec::with_capacity(layout.parameters.len());
        for def in &layout.parameters {
            let raw = (0..def.count)
                .map(|_| reader.read(def.bits))
                .collect::<Option<Vec<u64>>>()
                .ok_or_else(|| {
                    Error::Decode(format!(
                        "packet seq={} too short for parameter {} ({})",
                        packet.header.sequence_id, def.name, def.nix
                    ))
                })?;
            parameters.push(Parameter {
                nix: def.nix.clone(),
                name: def.name.clone(),
                raw,
                eng: None,
                curtx: def.curtx.clone(),
                unit: def.unit.clone(),
            });
        }
        trace!(
            seq = packet.header.sequence_id,
            params = parameters.len(),
            "decoded packet"
        );

        Ok(DecodedPacket {
            data_header: packet.data_header,
            ssid,
            sequence_count: packet.header.sequence_id,
            idb_version: self.idb.version.clone(),
            parameters,
        })
    }
}

/// Leaves packets unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecompression;

impl Decompressor for NoDecompression {
    fn decompress(&self, _packet: &mut DecodedPacket) -> Result<()> {
        Ok(())
    }
}

/// Compression scheme with `s` sign bits, `k` exponent bits and `m` mantissa bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skm {
    pub s: u8,
    pub k: u8,
    pub m: u8,
}

/// Expand a value compressed with `scheme` to the centre of its compression bin.
///
/// # Errors
/// [Error::Decode] if the scheme is invalid or `value` does not fit it.
pub fn decompress(value: u64, scheme: Skm) -> Result<i64> {
    let Skm { s, k, m } = scheme;
    if s > 1 || u32::from(s) + u32::from(k) + u32::from(m) > 8 {
        return Err(Error::Decode(format!("invalid compression scheme {scheme:?}")));
    }
    if k == 0 && m == 0 {
        return i64::try_from(value).map_err(|e| Error::Decode(e.to_string()));
    }
    if value >= 1 << (s + k + m) {
        return Err(Error::Decode(format!(
            "value {value} exceeds compression scheme {scheme:?}"
        )));
    }
    let negative = s == 1 && (value >> (k + m)) & 1 == 1;
    let abs = value & ((1 << (k + m)) - 1);
    let expanded = if abs < 1 << (m + 1) {
        abs
    } else {
        let exponent = u32::try_from((abs >> m) - 1)
            .ok()
            .filter(|e| e + u32::from(m) < u64::BITS)
            .ok_or_else(|| {
                Error::Decode(format!("value {value} overflows compression scheme {scheme:?}"))
            })?;
        let mantissa = abs & ((1 << m) - 1);
        let low = (mantissa | 1 << m) << exponent;
        low + ((1u64 << exponent) >> 1)
    };
    let expanded = i64::try_from(expanded).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(if negative { -expanded } else { expanded })
}

/// Decompresses parameters with a per-parameter compression scheme.
#[derive(Debug, Clone, Default)]
pub struct SkmDecompressor {
    schemes: HashMap<String, Skm>,
}

impl SkmDecompressor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompressor for the compression schemes listed in `idb`.
    #[must_use]
    pub fn for_idb(idb: &Idb) -> Self {
        Self {
            schemes: idb
                .compression
                .iter()
                .map(|(nix, scheme)| (nix.clone(), *scheme))
                .collect(),
        }
    }

    /// Decompress parameter `nix` with `scheme`.
    #[must_use]
    pub fn with_scheme(mut self, nix: &str, scheme: Skm) -> Self {
        self.schemes.insert(nix.to_string(), scheme);
        self
    }
}

impl Decompressor for SkmDecompressor {
    fn decompress(&self, packet: &mut DecodedPacket) -> Result<()> {
        for param in &mut packet.parameters {
            let Some(scheme) = self.schemes.get(&param.nix) else {
                continue;
            };
            let mut raw = Vec::with_capacity(param.raw.len());
            for value in &param.raw {
                // signed schemes only apply to values that are stored unsigned afterwards
                raw.push(decompress(*value, *scheme)?.unsigned_abs());
            }
            param.raw = raw;
        }
        Ok(())
    }
}

/// Performs no calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCalibration;

impl EngineeringCalibrator for NoCalibration {
    fn calibrate_packet(&self, _packet: &mut DecodedPacket) -> Result<()> {
        Ok(())
    }

    fn calibrate_product(&self, _product: &mut Product) -> Result<()> {
        Ok(())
    }
}

/// Applies the IDB calibration referenced by each parameter's `curtx`.
///
/// Packets are calibrated when the parameter has a calibration in the IDB. Product columns
/// still holding integers but carrying a `curtx` are calibrated as a whole.
#[derive(Debug, Clone)]
pub struct IdbCalibrator {
    idb: Arc<Idb>,
}

impl IdbCalibrator {
    #[must_use]
    pub fn new(idb: Arc<Idb>) -> Self {
        Self { idb }
    }
}

impl EngineeringCalibrator for IdbCalibrator {
    fn calibrate_packet(&self, packet: &mut DecodedPacket) -> Result<()> {
        for param in &mut packet.parameters {
            let Some(cal) = param.curtx.as_deref().and_then(|c| self.idb.calibration(c)) else {
                continue;
            };
            param.eng = Some(param.raw.iter().map(|v| cal.apply(*v as f64)).collect());
        }
        Ok(())
    }

    fn calibrate_product(&self, product: &mut Product) -> Result<()> {
        let columns = product
            .control
            .extra
            .iter_mut()
            .chain(product.data.columns.iter_mut());
        for column in columns {
            if !column.values.is_unsigned() {
                continue;
            }
            let Some(cal) = column
                .meta
                .curtx
                .as_deref()
                .and_then(|c| self.idb.calibration(c))
            else {
                continue;
            };
            let Some(raw) = column.values.to_u64() else {
                continue;
            };
            trace!(column = %column.name, "calibrating column");
            column.values = Values::F64(raw.iter().map(|v| cal.apply(*v as f64)).collect());
        }
        Ok(())
    }
}

/// The collaborators of a level transition.
#[derive(TypedBuilder)]
pub struct Processors {
    pub decoder: Box<dyn PacketDecoder>,
    #[builder(default=Box::new(NoDecompression))]
    pub decompressor: Box<dyn Decompressor>,
    #[builder(default=Box::new(NoCalibration))]
    pub calibrator: Box<dyn EngineeringCalibrator>,
    /// Selects the product variant built at L0.
    #[builder(default=Registry::standard())]
    pub registry: Registry,
    #[builder(default)]
    pub policy: PacketPolicy,
}

impl Processors {
    /// Processors driven by `idb`: layout decoding, SKM decompression and IDB calibration.
    #[must_use]
    pub fn for_idb(idb: Idb, policy: PacketPolicy) -> Self {
        let idb = Arc::new(idb);
        Processors::builder()
            .decoder(Box::new(LayoutDecoder::new(idb.clone())))
            .decompressor(Box::new(SkmDecompressor::for_idb(&idb)))
            .calibrator(Box::new(IdbCalibrator::new(idb)))
            .policy(policy)
            .build()
    }
}

/// Column of per-packet values of parameter `name`, `None` if a packet lacks it or the
/// count differs between packets.
pub(crate) fn parameter_column(packets: &[DecodedPacket], name: &str) -> Option<Column> {
    let first = packets.first()?.get(name)?;
    let width = first.count();
    let mut values: Option<Values> = None;
    for packet in packets {
        let param = packet.get(name)?;
        if param.count() != width {
            return None;
        }
        values = Some(match values {
            None => param.values(),
            Some(v) => v.concat(&param.values()).ok()?,
        });
    }
    let mut column = Column::new(name, values?)
        .with_width(width)
        .with_meta(ParamMeta {
            nix: Some(first.nix.clone()),
            curtx: first.curtx.clone(),
        });
    if let Some(unit) = &first.unit {
        column = column.with_unit(unit);
    }
    Some(column)
}
