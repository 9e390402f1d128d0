//! Level transitions LB → L0 → L1 → L2.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::table::{Column, Values};
use super::{Control, Data, Energies, Level, Product, ProductKind, Selector};
use crate::processing::{parameter_column, DecodedPacket, EngineeringCalibrator, Processors};
use crate::time::{ScetDelta, UNSYNCED_FLAG};
use crate::tmtc::TmPacket;
use crate::{Error, Result};

/// Array parameters of sampled packets that describe the whole packet rather than a sample.
const CONTROL_ARRAYS: [&str; 1] = ["energy_bin_edge_mask"];
/// Integration times are counted in 0.1 s steps.
const INTEGRATION_TIME_STEP: f64 = 0.1;

/// What to do with a packet that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketPolicy {
    /// Fail the whole transition.
    Abort,
    /// Log and leave the packet out.
    #[default]
    Skip,
}

impl Display for PacketPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketPolicy::Abort => "abort",
            PacketPolicy::Skip => "skip",
        })
    }
}

impl FromStr for PacketPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(PacketPolicy::Abort),
            "skip" => Ok(PacketPolicy::Skip),
            other => Err(Error::Config(format!("unknown packet policy {other:?}"))),
        }
    }
}

/// A telemetry packet and the raw file it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet: TmPacket,
    pub raw_file: String,
}

/// Product key of a packet, `(service_type, service_subtype, ssid)`.
pub type PacketKey = (u8, u8, Option<u8>);

fn transition_error(product: &Product, to: Level) -> Error {
    Error::Transition {
        from: product.level.to_string(),
        to: to.to_string(),
        kind: product.kind.to_string(),
    }
}

impl Product {
    /// Group packets by their product key and build one level binary product per key.
    ///
    /// # Errors
    /// As [Product::level_binary_from_packets].
    pub fn level_binary_products<I>(packets: I) -> Result<Vec<Product>>
    where
        I: IntoIterator<Item = RawPacket>,
    {
        let mut groups: BTreeMap<PacketKey, Vec<RawPacket>> = BTreeMap::new();
        for raw in packets {
            groups.entry(raw.packet.key()).or_default().push(raw);
        }
        groups
            .values()
            .map(|packets| Product::level_binary_from_packets(packets))
            .collect()
    }

    /// Build a level binary product from packets sharing one product key.
    ///
    /// Control holds the packet header fields with the synchronization flag moved from
    /// `scet_coarse` to `time_sync`. Data holds each packet as hex.
    ///
    /// # Errors
    /// [Error::Schema] if `packets` is empty or mixes product keys.
    pub fn level_binary_from_packets(packets: &[RawPacket]) -> Result<Product> {
        let Some(first) = packets.first() else {
            return Err(Error::Schema("no packets".to_string()));
        };
        let key = first.packet.key();
        if let Some(other) = packets.iter().find(|p| p.packet.key() != key) {
            return Err(Error::Schema(format!(
                "packets of different types {key:?} and {:?}",
                other.packet.key()
            )));
        }
        let (service_type, service_subtype, ssid) = key;
        let n = packets.len();

        let mut control = Control {
            scet_coarse: packets
                .iter()
                .map(|p| p.packet.data_header.scet_coarse & !UNSYNCED_FLAG)
                .collect(),
            scet_fine: packets.iter().map(|p| p.packet.data_header.scet_fine).collect(),
            integration_time: vec![ScetDelta::ZERO; n],
            index: (0..n).collect(),
            raw_file: packets.iter().map(|p| p.raw_file.clone()).collect(),
            parent: vec![String::new(); n],
            packet: packets.iter().map(|p| p.packet.offset.to_string()).collect(),
            ..Default::default()
        };
        control.add_uint("apid", &header_values(packets, |p| p.header.apid.into()));
        control.add_uint(
            "sequence_flag",
            &header_values(packets, |p| p.header.sequence_flags.into()),
        );
        control.add_uint(
            "sequence_count",
            &header_values(packets, |p| p.header.sequence_id.into()),
        );
        control.add_uint(
            "data_length",
            &header_values(packets, |p| p.header.len_minus1.into()),
        );
        control.add_uint(
            "destination_id",
            &header_values(packets, |p| p.data_header.destination_id.into()),
        );
        control.extra.insert(Column::new(
            "time_sync",
            Values::Bool(
                packets
                    .iter()
                    .map(|p| p.packet.data_header.scet_coarse & UNSYNCED_FLAG == 0)
                    .collect(),
            ),
        ));

        let mut data = Data {
            control_index: (0..n).collect(),
            columns: vec![Column::new(
                "data",
                Values::Str(packets.iter().map(|p| p.packet.to_hex()).collect()),
            )]
            .into(),
            ..Default::default()
        };
        data.fill_missing();

        debug!(
            stype = service_type,
            sstype = service_subtype,
            ?ssid,
            packets = n,
            "level binary"
        );
        Ok(Product::builder()
            .kind(ProductKind::LevelBinary {
                service_type,
                service_subtype,
                ssid,
            })
            .level(Level::LB)
            .service_type(service_type)
            .service_subtype(service_subtype)
            .ssid(ssid)
            .control(control)
            .data(data)
            .build())
    }

    /// Decode a level binary product into an L0 product.
    ///
    /// Packets that fail to decode are handled according to the processors' [PacketPolicy].
    /// The product variant is chosen by the processors' registry. Packets carrying
    /// `num_samples` and `integration_time` parameters produce one Data row per sample;
    /// all others one row per packet.
    ///
    /// # Errors
    /// [Error::Transition] if this is not a level binary product, [Error::MissingTable] if the
    /// packet data column is missing, errors from decoding when the policy is
    /// [PacketPolicy::Abort], or dispatch errors from the registry.
    pub fn to_level0(&self, processors: &Processors, parent: &str) -> Result<Product> {
        if self.level != Level::LB {
            return Err(transition_error(self, Level::L0));
        }
        let Some(hex) = self.data.columns.get("data") else {
            return Err(Error::MissingTable("data.data".to_string()));
        };
        let rows = self.control.rows_by_index();

        let mut decoded = Vec::with_capacity(self.data.len());
        let mut provenance = Vec::with_capacity(self.data.len());
        for row in 0..self.data.len() {
            match decode_row(processors, hex.values.str_at(row)) {
                Ok(packet) => {
                    let control_row = rows.get(&self.data.control_index[row]).copied();
                    provenance.push(control_row.map_or_else(
                        || (String::new(), String::new()),
                        |r| {
                            (
                                self.control.raw_file[r].clone(),
                                self.control.packet[r].clone(),
                            )
                        },
                    ));
                    decoded.push(packet);
                }
                Err(err) if processors.policy == PacketPolicy::Skip => {
                    warn!(row, kind = %self.kind, "skipping corrupt packet: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        if decoded.is_empty() {
            return Err(Error::Decode(format!("no decodable packets in {}", self.kind)));
        }

        let mut idb_versions = super::IdbVersions::new();
        for packet in &decoded {
            idb_versions
                .entry(packet.idb_version.clone())
                .or_default()
                .expand_time(packet.scet());
        }

        let selector = Selector::new(
            Level::L0,
            self.service_type,
            self.service_subtype,
            self.ssid,
        );
        let kind = processors.registry.dispatch(&selector)?;

        let sampled = decoded
            .iter()
            .all(|p| p.get("num_samples").is_some() && p.get("integration_time").is_some());
        let (control, data) = if sampled {
            let offset = u64::from(matches!(kind, ProductKind::QuickLook(_)));
            sampled_tables(&decoded, &provenance, parent, offset)?
        } else {
            packet_tables(&decoded, &provenance, parent)?
        };
        debug!(
            %kind,
            packets = decoded.len(),
            rows = data.len(),
            "level 0"
        );

        let product = Product::builder()
            .kind(kind)
            .level(Level::L0)
            .service_type(self.service_type)
            .service_subtype(self.service_subtype)
            .ssid(self.ssid)
            .control(control)
            .data(data)
            .idb_versions(idb_versions)
            .build();
        product.validate()?;
        Ok(product)
    }

    /// Derive the L1 product: engineering calibration of the whole product and, for quicklook
    /// and science products, the energy channels.
    ///
    /// # Errors
    /// [Error::Transition] if this is not an L0 product of a kind with an L1 form, otherwise
    /// calibration errors.
    pub fn to_level1(
        &self,
        calibrator: &dyn EngineeringCalibrator,
        parent: &str,
    ) -> Result<Product> {
        if self.level != Level::L0 || !self.kind.can_derive_l1() {
            return Err(transition_error(self, Level::L1));
        }
        let mut l1 = self.clone();
        l1.level = Level::L1;
        l1.header = None;
        l1.control.set_parent(parent);
        calibrator.calibrate_product(&mut l1)?;
        if matches!(self.kind, ProductKind::QuickLook(_) | ProductKind::Science(_)) {
            l1.energies = Some(Energies::for_control(&l1.control)?);
        }
        Ok(l1)
    }

    /// Derive the L2 product. `parent` may be a path, only its file name is recorded.
    ///
    /// # Errors
    /// [Error::Transition] if this is not an L1 product of a kind with an L2 form.
    pub fn to_level2(&self, parent: &str) -> Result<Product> {
        if self.level != Level::L1 || !self.kind.can_derive_l2() {
            return Err(transition_error(self, Level::L2));
        }
        let parent = Path::new(parent)
            .file_name()
            .map_or_else(|| parent.to_string(), |n| n.to_string_lossy().to_string());
        let mut l2 = self.clone();
        l2.level = Level::L2;
        l2.control.set_parent(&parent);
        Ok(l2)
    }

    /// Derive the product of the next level.
    ///
    /// # Errors
    /// [Error::Transition] for L2 and LL01 products, otherwise as the level specific methods.
    pub fn to_next_level(&self, processors: &Processors, parent: &str) -> Result<Product> {
        match self.level {
            Level::LB => self.to_level0(processors, parent),
            Level::L0 => self.to_level1(processors.calibrator.as_ref(), parent),
            Level::L1 => self.to_level2(parent),
            Level::L2 | Level::LL01 => Err(transition_error(self, Level::L2)),
        }
    }
}

fn header_values(packets: &[RawPacket], f: impl Fn(&TmPacket) -> u64) -> Vec<u64> {
    packets.iter().map(|p| f(&p.packet)).collect()
}

fn decode_row(processors: &Processors, hex: Option<&str>) -> Result<DecodedPacket> {
    let Some(hex) = hex else {
        return Err(Error::Decode("packet data is not text".to_string()));
    };
    let packet = TmPacket::from_hex(hex)?;
    let mut decoded = processors.decoder.decode(&packet)?;
    processors.decompressor.decompress(&mut decoded)?;
    processors.calibrator.calibrate_packet(&mut decoded)?;
    Ok(decoded)
}

fn base_control(
    decoded: &[DecodedPacket],
    provenance: &[(String, String)],
    parent: &str,
) -> Control {
    let n = decoded.len();
    Control {
        scet_coarse: decoded.iter().map(|p| p.scet().coarse()).collect(),
        scet_fine: decoded.iter().map(|p| p.scet().fine()).collect(),
        integration_time: vec![ScetDelta::ZERO; n],
        index: (0..n).collect(),
        raw_file: provenance.iter().map(|(raw, _)| raw.clone()).collect(),
        parent: vec![parent.to_string(); n],
        packet: provenance.iter().map(|(_, packet)| packet.clone()).collect(),
        extra: Default::default(),
    }
}

fn column(decoded: &[DecodedPacket], name: &str) -> Result<Column> {
    parameter_column(decoded, name).ok_or_else(|| {
        Error::Schema(format!("parameter {name} differs in shape between packets"))
    })
}

/// One Data row per packet with a column per parameter.
fn packet_tables(
    decoded: &[DecodedPacket],
    provenance: &[(String, String)],
    parent: &str,
) -> Result<(Control, Data)> {
    let control = base_control(decoded, provenance, parent);
    let mut data = Data {
        time: decoded.iter().map(DecodedPacket::scet).collect(),
        timedel: vec![ScetDelta::ZERO; decoded.len()],
        control_index: control.index.clone(),
        ..Default::default()
    };
    for param in &decoded[0].parameters {
        data.columns.insert(column(decoded, &param.name)?);
    }
    Ok((control, data))
}

/// One Data row per sample. Scalar parameters describe the packet and go to Control; array
/// parameters are split evenly over the packet's samples.
fn sampled_tables(
    decoded: &[DecodedPacket],
    provenance: &[(String, String)],
    parent: &str,
    integration_offset: u64,
) -> Result<(Control, Data)> {
    let (decoded, provenance): (Vec<DecodedPacket>, Vec<(String, String)>) = decoded
        .iter()
        .zip(provenance)
        .filter(|(p, _)| {
            let empty = matches!(p.raw_value("num_samples"), None | Some(0));
            if empty {
                debug!(scet = %p.scet(), "dropping packet without samples");
            }
            !empty
        })
        .map(|(p, prov)| (p.clone(), prov.clone()))
        .unzip();
    if decoded.is_empty() {
        return Err(Error::Decode("no packets with samples".to_string()));
    }

    let mut control = base_control(&decoded, &provenance, parent);
    control.integration_time = decoded
        .iter()
        .map(|p| {
            let steps = p.raw_value("integration_time").unwrap_or_default() + integration_offset;
            ScetDelta::from_seconds(steps as f64 * INTEGRATION_TIME_STEP)
        })
        .collect();

    let num_samples: Vec<usize> = decoded
        .iter()
        .map(|p| p.raw_value("num_samples").unwrap_or_default() as usize)
        .collect();
    let mut data = Data::default();
    for param in &decoded[0].parameters {
        if param.name == "integration_time" {
            continue;
        }
        if param.count() == 1 || CONTROL_ARRAYS.contains(&param.name.as_str()) {
            control.extra.insert(column(&decoded, &param.name)?);
            continue;
        }

        let mut values: Option<Values> = None;
        let mut width = None;
        for (packet, ns) in decoded.iter().zip(&num_samples) {
            let Some(p) = packet.get(&param.name) else {
                return Err(Error::Schema(format!("packet without parameter {}", param.name)));
            };
            if p.count() % ns != 0 || width.is_some_and(|w| w != p.count() / ns) {
                return Err(Error::Schema(format!(
                    "parameter {} with {} values cannot be split into {ns} samples",
                    param.name,
                    p.count()
                )));
            }
            width = Some(p.count() / ns);
            values = Some(match values {
                None => p.values(),
                Some(v) => v.concat(&p.values())?,
            });
        }
        if let (Some(values), Some(width)) = (values, width) {
            let mut col = Column::new(&param.name, values).with_width(width);
            col.meta.nix = Some(param.nix.clone());
            col.meta.curtx.clone_from(&param.curtx);
            data.columns.insert(col);
        }
    }

    let (time, timedel, _) = control.sample_times()?;
    data.time = time;
    data.timedel = timedel;
    data.control_index = num_samples
        .iter()
        .enumerate()
        .flat_map(|(row, ns)| std::iter::repeat(row).take(*ns))
        .collect();
    Ok((control, data))
}
