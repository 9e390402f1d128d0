use std::collections::{HashMap, HashSet};

use tracing::{debug, error};

use super::{Control, Data, IdbVersions, Level, Product};
use crate::{Error, Result};

/// Which input a row came from. Paired with the row's original index it identifies a source
/// Control row even when both inputs use the same index values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Origin {
    This,
    Other,
}

type Tag = (Origin, usize);

/// Time key used to detect duplicate samples: seconds rounded to 2 decimals.
fn time_key(seconds: f64) -> i64 {
    (seconds * 100.0).round_ties_even() as i64
}

impl Product {
    /// Combine two products of the same kind into one time ordered product without duplicate
    /// samples.
    ///
    /// Samples whose times agree to 2 decimals are duplicates; the one from the product
    /// starting earlier (or `self` on a tie) is kept. Control rows no longer referenced are
    /// dropped and the remaining ones renumbered `0..n` in order of first reference. IDB version
    /// ranges of both inputs are merged. The result has the level of `self`.
    ///
    /// # Errors
    /// [Error::TypeMismatch] if the products are of different kinds, [Error::Schema] if their
    /// parameter columns cannot be joined.
    pub fn combine(&self, other: &Product) -> Result<Product> {
        if self.kind != other.kind {
            return Err(Error::TypeMismatch {
                left: self.kind.to_string(),
                right: other.kind.to_string(),
            });
        }
        if self.level == Level::LB {
            return self.combine_level_binary(other);
        }

        let control = self.control.concat(&other.control)?;
        let control_tags: Vec<Tag> = tags(Origin::This, &self.control.index)
            .chain(tags(Origin::Other, &other.control.index))
            .collect();

        debug!(
            this = self.data.len(),
            other = other.data.len(),
            kind = %self.kind,
            "combining"
        );
        let (data, data_tags) =
            if self.scet_timerange().start <= other.scet_timerange().start {
                (
                    self.data.concat(&other.data)?,
                    tags(Origin::This, &self.data.control_index)
                        .chain(tags(Origin::Other, &other.data.control_index))
                        .collect::<Vec<_>>(),
                )
            } else {
                (
                    other.data.concat(&self.data)?,
                    tags(Origin::Other, &other.data.control_index)
                        .chain(tags(Origin::This, &self.data.control_index))
                        .collect::<Vec<_>>(),
                )
            };

        // first occurrence of every time key survives, then stable sort by key
        let keys: Vec<i64> = data.time.iter().map(|t| time_key(t.as_float())).collect();
        let mut seen = HashSet::new();
        let mut rows: Vec<usize> = (0..data.len()).filter(|r| seen.insert(keys[*r])).collect();
        rows.sort_by_key(|r| keys[*r]);
        debug!(stacked = data.len(), unique = rows.len(), "deduplicated");

        let mut new_ids: HashMap<Tag, usize> = HashMap::new();
        for row in &rows {
            let next = new_ids.len();
            new_ids.entry(data_tags[*row]).or_insert(next);
        }

        let mut data = data.take(&rows);
        data.control_index = rows.iter().map(|r| new_ids[&data_tags[*r]]).collect();

        let mut kept: Vec<(usize, usize)> = control_tags
            .iter()
            .enumerate()
            .filter_map(|(row, tag)| new_ids.get(tag).map(|id| (*id, row)))
            .collect();
        kept.sort_unstable();
        let mut control = control.take(&kept.iter().map(|(_, row)| *row).collect::<Vec<_>>());
        control.index = kept.iter().map(|(id, _)| *id).collect();

        let mut combined = self.with_tables(control, data);
        combined.idb_versions = merge_idb_versions(&self.idb_versions, &other.idb_versions);
        // merged data no longer corresponds to a single file
        combined.header = None;
        Ok(combined)
    }

    /// Level binary products carry no sample times. Packets are deduplicated on their time and
    /// sequence count and ordered by time, each keeping its own data row.
    fn combine_level_binary(&self, other: &Product) -> Result<Product> {
        let offset = self.control.index.iter().max().map_or(0, |m| m + 1);
        let mut theirs_control = other.control.clone();
        theirs_control.index.iter_mut().for_each(|i| *i += offset);
        let mut theirs_data = other.data.clone();
        theirs_data
            .control_index
            .iter_mut()
            .for_each(|i| *i += offset);

        let control = self.control.concat(&theirs_control)?;
        let data = self.data.concat(&theirs_data)?;

        let key = |row: usize| {
            (
                control.scet(row),
                control.extra_u64("sequence_count", row).unwrap_or_default(),
            )
        };
        let mut seen = HashSet::new();
        let mut rows: Vec<usize> = (0..control.len()).filter(|r| seen.insert(key(*r))).collect();
        rows.sort_by_key(|r| key(*r));

        let mut data_rows_by_index: HashMap<usize, Vec<usize>> = HashMap::new();
        for (row, ci) in data.control_index.iter().enumerate() {
            data_rows_by_index.entry(*ci).or_default().push(row);
        }

        let mut data_rows = Vec::new();
        let mut control_index = Vec::new();
        for (new, row) in rows.iter().enumerate() {
            for data_row in data_rows_by_index.get(&control.index[*row]).into_iter().flatten() {
                data_rows.push(*data_row);
                control_index.push(new);
            }
        }

        let mut control = control.take(&rows);
        control.index = (0..rows.len()).collect();
        let mut data = data.take(&data_rows);
        data.control_index = control_index;

        check_data_length(&control, &data);

        let mut combined = self.with_tables(control, data);
        combined.header = None;
        Ok(combined)
    }
}

fn tags(origin: Origin, indices: &[usize]) -> impl Iterator<Item = Tag> + '_ {
    indices.iter().map(move |i| (origin, *i))
}

/// Copy of `this` expanded by every range in `other`.
pub(crate) fn merge_idb_versions(this: &IdbVersions, other: &IdbVersions) -> IdbVersions {
    let mut merged = this.clone();
    for (version, range) in other {
        merged.entry(version.clone()).or_default().expand(range);
    }
    merged
}

/// Hex encoded packets must be `data_length + 7` bytes long.
fn check_data_length(control: &Control, data: &Data) {
    let Some(hex) = data.columns.get("data") else {
        return;
    };
    let mismatched = data
        .control_index
        .iter()
        .enumerate()
        .filter(|(row, ci)| {
            let actual = hex.values.str_at(*row).map_or(0, |s| s.len() / 2);
            control
                .extra_u64("data_length", **ci)
                .is_some_and(|expected| actual as u64 != expected + 7)
        })
        .count();
    if mismatched > 0 {
        error!(mismatched, "expected and actual data length do not match");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::table::{Column, Values};
    use crate::products::ProductKind;
    use crate::time::{ScetDelta, ScetTime, ScetTimeRange};

    fn ql(times: &[f64], refs: &[usize], counts: &[u32]) -> Product {
        let n = refs.iter().max().map_or(0, |m| m + 1);
        let mut control = Control {
            scet_coarse: vec![times.first().copied().unwrap_or_default() as u32; n],
            index: (0..n).collect(),
            ..Default::default()
        };
        control.fill_missing();
        let data = Data {
            time: times.iter().map(|t| ScetTime::from_float(*t)).collect(),
            timedel: vec![ScetDelta::from_seconds(0.5); times.len()],
            control_index: refs.to_vec(),
            columns: vec![Column::new("counts", Values::U32(counts.to_vec()))].into(),
        };
        Product::builder()
            .kind(ProductKind::QuickLook(crate::products::QlProduct::LightCurve))
            .level(Level::L0)
            .service_type(21)
            .service_subtype(6)
            .ssid(Some(30))
            .control(control)
            .data(data)
            .build()
    }

    fn times(p: &Product) -> Vec<f64> {
        p.data.time.iter().map(ScetTime::as_float).collect()
    }

    #[test]
    fn combine_interleaved_packets() {
        let a = ql(&[0.0, 1.0], &[0, 0], &[1, 2]);
        let b = ql(&[0.5, 2.0], &[0, 0], &[3, 4]);

        let c = a.combine(&b).unwrap();
        assert_eq!(c.control.len(), 2);
        assert_eq!(c.control.index, vec![0, 1]);
        assert_eq!(times(&c), vec![0.0, 0.5, 1.0, 2.0]);
        assert_eq!(c.data.control_index, vec![0, 1, 0, 1]);
        assert_eq!(
            c.data.columns.get("counts").unwrap().values,
            Values::U32(vec![1, 3, 2, 4])
        );
        c.validate().unwrap();

        // inputs untouched
        assert_eq!(times(&a), vec![0.0, 1.0]);
        assert_eq!(b.data.control_index, vec![0, 0]);
    }

    #[test]
    fn combine_mismatched_kinds() {
        let a = ql(&[0.0], &[0], &[1]);
        let mut b = ql(&[1.0], &[0], &[1]);
        b.kind = ProductKind::QuickLook(crate::products::QlProduct::FlareFlag);
        match a.combine(&b) {
            Err(Error::TypeMismatch { left, right }) => {
                assert_eq!(left, "ql-lightcurve");
                assert_eq!(right, "ql-flareflag");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn combine_drops_duplicates_and_orphans() {
        let a = ql(&[0.0, 1.0, 2.0], &[0, 0, 1], &[1, 2, 3]);
        // every sample duplicates one of `a`, within rounding tolerance
        let b = ql(&[1.001, 2.0], &[0, 0], &[9, 9]);

        let c = a.combine(&b).unwrap();
        assert_eq!(times(&c), vec![0.0, 1.0, 2.0]);
        assert_eq!(c.control.len(), 2);
        assert_eq!(
            c.data.columns.get("counts").unwrap().values,
            Values::U32(vec![1, 2, 3])
        );
        c.validate().unwrap();

        let again = c.combine(&c).unwrap();
        assert_eq!(again.data.len(), c.data.len());
        assert_eq!(again.control.len(), c.control.len());
    }

    #[test]
    fn combine_later_first_puts_earlier_data_first() {
        let late = ql(&[10.0, 11.0], &[0, 0], &[1, 2]);
        let early = ql(&[5.0, 10.0], &[0, 0], &[3, 4]);
        let c = late.combine(&early).unwrap();
        // 10.0 duplicated: the earlier starting product wins
        assert_eq!(times(&c), vec![5.0, 10.0, 11.0]);
        assert_eq!(
            c.data.columns.get("counts").unwrap().values,
            Values::U32(vec![3, 4, 2])
        );
        assert_eq!(c.data.control_index, vec![0, 0, 1]);
        assert_eq!(c.level, late.level);
    }

    #[test]
    fn combine_expands_idb_versions() {
        let mut a = ql(&[0.0], &[0], &[1]);
        let mut b = ql(&[5.0], &[0], &[1]);
        let r = |s: u32, e: u32| ScetTimeRange::new(ScetTime::new(s, 0), ScetTime::new(e, 0));
        a.idb_versions.insert("2.26.34".into(), r(0, 10));
        b.idb_versions.insert("2.26.34".into(), r(5, 20));
        b.idb_versions.insert("2.26.35".into(), r(30, 40));

        let c = a.combine(&b).unwrap();
        for input in [&a, &b] {
            for (version, range) in &input.idb_versions {
                assert!(c.idb_versions[version].covers(range), "{version}");
            }
        }
        assert_eq!(c.idb_versions["2.26.34"], r(0, 20));
        // source map untouched
        assert_eq!(a.idb_versions["2.26.34"], r(0, 10));
    }

    fn lb(packets: &[(u32, u64)]) -> Product {
        let n = packets.len();
        let mut control = Control {
            scet_coarse: packets.iter().map(|(c, _)| *c).collect(),
            index: (0..n).collect(),
            ..Default::default()
        };
        control.fill_missing();
        control.add_uint("sequence_count", &packets.iter().map(|(_, s)| *s).collect::<Vec<_>>());
        control.add_uint("data_length", &vec![1; n]);
        let mut data = Data {
            control_index: (0..n).collect(),
            columns: vec![Column::new(
                "data",
                Values::Str(packets.iter().map(|(c, _)| format!("{c:016x}")).collect()),
            )]
            .into(),
            ..Default::default()
        };
        data.fill_missing();
        Product::builder()
            .kind(ProductKind::LevelBinary {
                service_type: 21,
                service_subtype: 6,
                ssid: Some(30),
            })
            .level(Level::LB)
            .service_type(21)
            .service_subtype(6)
            .ssid(Some(30))
            .control(control)
            .data(data)
            .build()
    }

    #[test]
    fn combine_level_binary_dedups_packets() {
        let a = lb(&[(10, 1), (30, 3)]);
        let b = lb(&[(20, 2), (30, 3), (40, 4)]);
        let c = a.combine(&b).unwrap();

        assert_eq!(c.control.scet_coarse, vec![10, 20, 30, 40]);
        assert_eq!(c.control.index, vec![0, 1, 2, 3]);
        assert_eq!(c.data.control_index, vec![0, 1, 2, 3]);
        assert_eq!(
            c.data.columns.get("data").unwrap().values.str_at(1),
            Some(format!("{:016x}", 20).as_str())
        );
        c.validate().unwrap();
    }
}
