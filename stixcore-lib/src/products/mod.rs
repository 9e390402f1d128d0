//! The product data model.
//!
//! A [Product] is a pair of relational tables: [Control] holds one row per packet (or per
//! request) and [Data] one row per sample, joined by `Data::control_index` to
//! `Control::index`. All operations return new products and leave their inputs untouched.
mod control;
mod data;
mod energies;
mod kind;
mod levels;
mod merge;
mod registry;
mod split;
pub mod table;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::io::Header;
use crate::time::ScetTimeRange;
use crate::{Error, Result};

pub use control::Control;
pub use data::Data;
pub use energies::Energies;
pub use kind::{service_name, HkReport, ProductKind, QlProduct, ScienceProduct};
pub use levels::{PacketPolicy, RawPacket};
pub use registry::{Registration, Registry, Selector};
pub use split::DayPartitions;

/// IDB version label to the time range of packets processed with it.
pub type IdbVersions = BTreeMap<String, ScetTimeRange>;

/// Processing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Level binary: undecoded packets.
    LB,
    L0,
    L1,
    L2,
    /// Low latency level 1, load only.
    LL01,
}

impl Level {
    /// The level derived from this one, if any.
    #[must_use]
    pub fn next(&self) -> Option<Level> {
        match self {
            Level::LB => Some(Level::L0),
            Level::L0 => Some(Level::L1),
            Level::L1 => Some(Level::L2),
            Level::L2 | Level::LL01 => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::LB => "LB",
            Level::L0 => "L0",
            Level::L1 => "L1",
            Level::L2 => "L2",
            Level::LL01 => "LL01",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LB" => Ok(Level::LB),
            "L0" => Ok(Level::L0),
            "L1" => Ok(Level::L1),
            "L2" => Ok(Level::L2),
            "LL01" => Ok(Level::LL01),
            other => Err(Error::Header(format!("unknown level {other:?}"))),
        }
    }
}

/// A data product: identifying attributes plus the Control/Data table pair.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Product {
    pub kind: ProductKind,
    pub level: Level,
    pub service_type: u8,
    pub service_subtype: u8,
    #[builder(default)]
    pub ssid: Option<u8>,
    pub control: Control,
    pub data: Data,
    #[builder(default)]
    pub idb_versions: IdbVersions,
    #[builder(default)]
    pub energies: Option<Energies>,
    /// Header of the file this product was loaded from. Shared read-only with fragments and
    /// derived products.
    #[builder(default)]
    pub header: Option<Arc<Header>>,
}

impl Product {
    #[must_use]
    pub fn name(&self) -> String {
        self.kind.name()
    }

    #[must_use]
    pub fn product_type(&self) -> &'static str {
        self.kind.product_type()
    }

    /// Sorted unique raw telemetry file names.
    #[must_use]
    pub fn raw(&self) -> Vec<String> {
        unique_sorted(&self.control.raw_file)
    }

    /// Sorted unique parent file names.
    #[must_use]
    pub fn parent(&self) -> Vec<String> {
        unique_sorted(&self.control.parent)
    }

    /// Time covered by the product. Level binary products carry no sample times, so their
    /// range is that of the packet times.
    #[must_use]
    pub fn scet_timerange(&self) -> ScetTimeRange {
        if self.level == Level::LB || self.data.is_empty() {
            self.control.scet_timerange()
        } else {
            self.data.scet_timerange()
        }
    }

    /// Check table shapes, index density and referential integrity between the tables.
    ///
    /// # Errors
    /// [Error::Schema] or [Error::Integrity] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;
        self.data.validate()?;

        let indices: HashSet<usize> = self.control.index.iter().copied().collect();
        if let Some(missing) = self
            .data
            .control_index
            .iter()
            .find(|ci| !indices.contains(ci))
        {
            return Err(Error::Integrity(format!(
                "data references control index {missing} which does not exist"
            )));
        }
        let referenced: HashSet<usize> = self.data.control_index.iter().copied().collect();
        if let Some(orphan) = self.control.index.iter().find(|i| !referenced.contains(i)) {
            return Err(Error::Integrity(format!(
                "control index {orphan} is not referenced by any data row"
            )));
        }
        Ok(())
    }

    /// A product of the same kind and identity with new tables.
    pub(crate) fn with_tables(&self, control: Control, data: Data) -> Product {
        Product {
            kind: self.kind,
            level: self.level,
            service_type: self.service_type,
            service_subtype: self.service_subtype,
            ssid: self.ssid,
            control,
            data,
            idb_versions: self.idb_versions.clone(),
            energies: self.energies.clone(),
            header: self.header.clone(),
        }
    }
}

impl Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Product{{{}, {}, {}, control={}, data={}}}",
            self.kind,
            self.level,
            self.scet_timerange(),
            self.control.len(),
            self.data.len()
        )
    }
}

fn unique_sorted(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Select the control rows referenced by `data` and renumber both tables so the control index
/// is dense from 0, preserving the relative order of the original index values.
pub(crate) fn densify(control: &Control, mut data: Data) -> (Control, Data) {
    let referenced: BTreeSet<usize> = data.control_index.iter().copied().collect();
    let mapping: HashMap<usize, usize> = referenced
        .iter()
        .enumerate()
        .map(|(new, old)| (*old, new))
        .collect();

    let mut rows: Vec<usize> = control
        .index
        .iter()
        .enumerate()
        .filter(|(_, idx)| referenced.contains(idx))
        .map(|(row, _)| row)
        .collect();
    rows.sort_by_key(|row| control.index[*row]);

    let mut control = control.take(&rows);
    control.remap_index(&mapping);
    for ci in &mut data.control_index {
        if let Some(new) = mapping.get(ci) {
            *ci = *new;
        }
    }
    (control, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ScetDelta, ScetTime};

    pub(crate) fn product(level: Level, control_len: usize, refs: &[usize]) -> Product {
        let mut control = Control {
            scet_coarse: (0..control_len as u32).collect(),
            index: (0..control_len).collect(),
            ..Default::default()
        };
        control.fill_missing();
        let data = Data {
            time: (0..refs.len()).map(|i| ScetTime::new(i as u32, 0)).collect(),
            timedel: vec![ScetDelta::ZERO; refs.len()],
            control_index: refs.to_vec(),
            ..Default::default()
        };
        Product::builder()
            .kind(ProductKind::Generic {
                service_type: 5,
                service_subtype: 1,
                ssid: None,
            })
            .level(level)
            .service_type(5)
            .service_subtype(1)
            .control(control)
            .data(data)
            .build()
    }

    #[test]
    fn level_order_and_parse() {
        assert!(Level::LB < Level::L0 && Level::L1 < Level::L2);
        assert_eq!(Level::L0.next(), Some(Level::L1));
        assert_eq!(Level::L2.next(), None);
        assert_eq!("l1".parse::<Level>().unwrap(), Level::L1);
        assert!(matches!("L9".parse::<Level>(), Err(Error::Header(_))));
    }

    #[test]
    fn validate_integrity() {
        assert!(product(Level::L0, 2, &[0, 0, 1]).validate().is_ok());
        // dangling reference
        assert!(matches!(
            product(Level::L0, 2, &[0, 2]).validate(),
            Err(Error::Integrity(_))
        ));
        // orphan control row
        assert!(matches!(
            product(Level::L0, 2, &[0, 0]).validate(),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn provenance_is_sorted_unique() {
        let mut p = product(Level::L0, 3, &[0, 1, 2]);
        p.control.raw_file = vec!["b".into(), "a".into(), "b".into()];
        assert_eq!(p.raw(), vec!["a", "b"]);
        assert!(p.parent().is_empty());
    }

    #[test]
    fn densify_drops_unreferenced() {
        let p = product(Level::L0, 4, &[1, 3, 3]);
        let (control, data) = densify(&p.control, p.data.clone());
        assert_eq!(control.index, vec![0, 1]);
        assert_eq!(control.scet_coarse, vec![1, 3]);
        assert_eq!(data.control_index, vec![0, 1, 1]);
    }
}
