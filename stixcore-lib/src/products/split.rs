use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use super::{densify, Level, Product};
use crate::time::{ScetTime, TimeService, UtcDay, UNSYNCED_FLAG};

/// Day a row belongs to: instrument clock days for LB and L0, UTC days above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum DayKey {
    Sceday(u32),
    Utc(UtcDay),
}

/// Iterator over the single day fragments of a product, in ascending day order.
///
/// Fragments are built on demand. A clone continues independently from the same position;
/// call [Product::partition_by_day] again to start over.
#[derive(Clone)]
pub struct DayPartitions<'a> {
    product: &'a Product,
    /// Day of each Data row, or of each Control row for level binary products.
    row_days: Vec<Option<DayKey>>,
    days: std::vec::IntoIter<DayKey>,
}

impl Product {
    /// Split into one product per day.
    ///
    /// Level binary products are split on the instrument day of their packet times, excluding
    /// packets without synchronized time. L0 products are split on the instrument day of each
    /// sample, L1 and L2 products on the UTC day of each sample as given by `time`. Every
    /// fragment has a dense control index starting at 0 and shares this product's IDB
    /// versions and header. Days without samples produce no fragment.
    #[must_use]
    pub fn partition_by_day<'a>(&'a self, time: &'a dyn TimeService) -> DayPartitions<'a> {
        let row_days: Vec<Option<DayKey>> = match self.level {
            Level::LB => (0..self.control.len())
                .map(|row| {
                    let synced = self.control.scet_coarse[row] & UNSYNCED_FLAG == 0
                        && self
                            .control
                            .extra_u64("time_sync", row)
                            .map_or(true, |v| v == 1);
                    synced.then(|| DayKey::Sceday(self.control.scet(row).sceday()))
                })
                .collect(),
            Level::L0 => self
                .data
                .time
                .iter()
                .map(|t| Some(DayKey::Sceday(t.sceday())))
                .collect(),
            Level::L1 | Level::L2 | Level::LL01 => self
                .data
                .time
                .iter()
                .map(|t: &ScetTime| Some(DayKey::Utc(time.utc_day(*t))))
                .collect(),
        };
        let days: BTreeSet<DayKey> = row_days.iter().flatten().copied().collect();
        debug!(level = %self.level, days = days.len(), "partitioning by day");

        DayPartitions {
            product: self,
            row_days,
            days: days.into_iter().collect::<Vec<_>>().into_iter(),
        }
    }
}

impl DayPartitions<'_> {
    fn level_binary_fragment(&self, day: DayKey) -> Product {
        let p = self.product;
        let indices: HashSet<usize> = self
            .row_days
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == Some(day))
            .map(|(row, _)| p.control.index[row])
            .collect();
        let data_rows: Vec<usize> = (0..p.data.len())
            .filter(|row| indices.contains(&p.data.control_index[*row]))
            .collect();
        let (control, data) = densify(&p.control, p.data.take(&data_rows));
        p.with_tables(control, data)
    }

    fn fragment(&self, day: DayKey) -> Product {
        let p = self.product;
        let rows: Vec<usize> = self
            .row_days
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == Some(day))
            .map(|(row, _)| row)
            .collect();
        let mut data = p.data.take(&rows);

        let referenced: BTreeSet<usize> = data.control_index.iter().copied().collect();
        let min = referenced.first().copied().unwrap_or_default();
        let contiguous = referenced.last().map_or(true, |max| max - min + 1 == referenced.len());
        if !contiguous {
            debug!(?day, "control indices of fragment are not contiguous; renumbering");
            let (control, data) = densify(&p.control, data);
            return p.with_tables(control, data);
        }

        let control_rows: Vec<usize> = (0..p.control.len())
            .filter(|row| referenced.contains(&p.control.index[*row]))
            .collect();
        let mut control = p.control.take(&control_rows);
        control.index.iter_mut().for_each(|i| *i -= min);
        data.control_index.iter_mut().for_each(|i| *i -= min);
        p.with_tables(control, data)
    }
}

impl Iterator for DayPartitions<'_> {
    type Item = Product;

    fn next(&mut self) -> Option<Self::Item> {
        let day = self.days.next()?;
        let fragment = if self.product.level == Level::LB {
            self.level_binary_fragment(day)
        } else {
            self.fragment(day)
        };
        if fragment.data.is_empty() {
            // only possible for level binary packets without data rows
            return self.next();
        }
        Some(fragment)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.days.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::Header;
    use crate::products::{Control, Data, ProductKind};
    use crate::time::{LinearClock, ScetDelta, ScetTimeRange, SEC_IN_DAY};

    fn product(level: Level, days_and_refs: &[(u32, usize)]) -> Product {
        let n = days_and_refs.iter().map(|(_, r)| r + 1).max().unwrap_or(0);
        let mut control = Control {
            scet_coarse: (0..n as u32).collect(),
            index: (0..n).collect(),
            ..Default::default()
        };
        control.fill_missing();
        let data = Data {
            time: days_and_refs
                .iter()
                .enumerate()
                .map(|(i, (day, _))| ScetTime::new(day * SEC_IN_DAY + i as u32, 0))
                .collect(),
            timedel: vec![ScetDelta::ZERO; days_and_refs.len()],
            control_index: days_and_refs.iter().map(|(_, r)| *r).collect(),
            ..Default::default()
        };
        let mut p = Product::builder()
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
            .header(Some(Arc::new(Header::default())))
            .build();
        p.idb_versions
            .insert("2.26.34".into(), ScetTimeRange::new(ScetTime::MIN, ScetTime::MAX));
        p
    }

    #[test]
    fn split_skips_empty_days() {
        let p = product(
            Level::L0,
            &[(100, 0), (100, 0), (101, 1), (101, 2), (103, 3), (103, 3)],
        );
        let clock = LinearClock::default();
        let fragments: Vec<Product> = p.partition_by_day(&clock).collect();
        assert_eq!(fragments.len(), 3);

        let days: Vec<u32> = fragments.iter().map(|f| f.data.time[0].sceday()).collect();
        assert_eq!(days, vec![100, 101, 103]);

        assert_eq!(fragments[1].control.index, vec![0, 1]);
        assert_eq!(fragments[1].data.control_index, vec![0, 1]);
        assert_eq!(fragments[2].control.scet_coarse, vec![3]);

        let total: usize = fragments.iter().map(|f| f.data.len()).sum();
        assert_eq!(total, p.data.len());
        for f in &fragments {
            f.validate().unwrap();
            assert_eq!(f.idb_versions, p.idb_versions);
            assert!(Arc::ptr_eq(
                f.header.as_ref().unwrap(),
                p.header.as_ref().unwrap()
            ));
        }
    }

    #[test]
    fn split_is_restartable() {
        let p = product(Level::L0, &[(1, 0), (2, 1)]);
        let clock = LinearClock::default();
        let parts = p.partition_by_day(&clock);
        assert_eq!(parts.clone().count(), 2);
        assert_eq!(parts.count(), 2);
        assert_eq!(p.partition_by_day(&clock).count(), 2);
    }

    #[test]
    fn split_straddling_packet() {
        // control row 1 has samples on both days and is shared by both fragments
        let p = product(Level::L0, &[(5, 0), (5, 1), (6, 1), (6, 2)]);
        let clock = LinearClock::default();
        let fragments: Vec<Product> = p.partition_by_day(&clock).collect();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].control.scet_coarse, vec![0, 1]);
        assert_eq!(fragments[1].control.scet_coarse, vec![1, 2]);
        for f in &fragments {
            f.validate().unwrap();
        }
    }

    #[test]
    fn split_non_contiguous_is_renumbered() {
        // day 8 references control rows 0 and 2 only
        let p = product(Level::L0, &[(8, 0), (9, 1), (8, 2)]);
        let mut sorted = p.clone();
        sorted.data = p.data.take(&[0, 2, 1]);
        let clock = LinearClock::default();
        let fragments: Vec<Product> = sorted.partition_by_day(&clock).collect();
        assert_eq!(fragments[0].control.index, vec![0, 1]);
        assert_eq!(fragments[0].control.scet_coarse, vec![0, 2]);
        assert_eq!(fragments[0].data.control_index, vec![0, 1]);
        fragments[0].validate().unwrap();
    }

    #[test]
    fn split_utc_days() {
        let p = product(Level::L1, &[(0, 0), (0, 0), (1, 1)]);
        let clock = LinearClock::default();
        let fragments: Vec<Product> = p.partition_by_day(&clock).collect();
        assert_eq!(fragments.len(), 2);
        assert_eq!(clock.utc_day(fragments[1].data.time[0]).to_string(), "20000102");
    }

    #[test]
    fn split_level_binary_excludes_unsynced() {
        let mut control = Control {
            scet_coarse: vec![10, SEC_IN_DAY + 10, 20],
            index: vec![0, 1, 2],
            ..Default::default()
        };
        control.fill_missing();
        control.add_uint("time_sync", &[1, 1, 0]);
        let mut data = Data {
            control_index: vec![0, 1, 2],
            ..Default::default()
        };
        data.fill_missing();
        let p = Product::builder()
            .kind(ProductKind::LevelBinary {
                service_type: 3,
                service_subtype: 25,
                ssid: Some(1),
            })
            .level(Level::LB)
            .service_type(3)
            .service_subtype(25)
            .ssid(Some(1))
            .control(control)
            .data(data)
            .build();

        let clock = LinearClock::default();
        let fragments: Vec<Product> = p.partition_by_day(&clock).collect();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].control.scet_coarse, vec![10]);
        assert_eq!(fragments[1].control.scet_coarse, vec![SEC_IN_DAY + 10]);
        for f in &fragments {
            assert_eq!(f.control.index, vec![0]);
            f.validate().unwrap();
        }
    }
}
