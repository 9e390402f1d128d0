use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::table::{Column, Columns, Values};
use crate::time::{ScetDelta, ScetTime, ScetTimeRange};
use crate::{Error, Result};

/// Per packet (or per request) metadata of a product.
///
/// `index` is the join key referenced by [Data::control_index](super::Data) and must be a
/// dense `0..len` numbering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
    #[serde(default)]
    pub scet_coarse: Vec<u32>,
    #[serde(default)]
    pub scet_fine: Vec<u16>,
    #[serde(default)]
    pub integration_time: Vec<ScetDelta>,
    pub index: Vec<usize>,
    #[serde(default)]
    pub raw_file: Vec<String>,
    #[serde(default)]
    pub parent: Vec<String>,
    #[serde(default)]
    pub packet: Vec<String>,
    /// Packet type specific columns, e.g., `request_id` or `sequence_count`.
    #[serde(default)]
    pub extra: Columns,
}

impl Control {
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Packet time of row `row`.
    #[must_use]
    pub fn scet(&self, row: usize) -> ScetTime {
        ScetTime::new(self.scet_coarse[row], self.scet_fine[row])
    }

    /// Range spanned by the packet times.
    #[must_use]
    pub fn scet_timerange(&self) -> ScetTimeRange {
        let mut range = ScetTimeRange::default();
        for row in 0..self.len() {
            range.expand_time(self.scet(row));
        }
        range
    }

    /// Maps each `index` value to its row.
    #[must_use]
    pub fn rows_by_index(&self) -> HashMap<usize, usize> {
        self.index
            .iter()
            .enumerate()
            .map(|(row, idx)| (*idx, row))
            .collect()
    }

    /// Unsigned value of extra column `name` at `row`.
    #[must_use]
    pub fn extra_u64(&self, name: &str, row: usize) -> Option<u64> {
        self.extra.get(name).and_then(|c| c.values.u64_at(row))
    }

    /// Overwrite the `parent` of every row.
    pub fn set_parent(&mut self, parent: &str) {
        self.parent = vec![parent.to_string(); self.len()];
    }

    /// Zero-fill optional columns that were not present when loading.
    pub fn fill_missing(&mut self) {
        let n = self.len();
        if n > 0 && self.scet_coarse.is_empty() {
            debug!(rows = n, "no scet_coarse column; defaulting to 0");
            self.scet_coarse = vec![0; n];
        }
        if n > 0 && self.scet_fine.is_empty() {
            debug!(rows = n, "no scet_fine column; defaulting to 0");
            self.scet_fine = vec![0; n];
        }
        if n > 0 && self.integration_time.is_empty() {
            debug!(rows = n, "no integration_time column; defaulting to 0");
            self.integration_time = vec![ScetDelta::ZERO; n];
        }
        for col in [&mut self.raw_file, &mut self.parent, &mut self.packet] {
            if col.is_empty() {
                *col = vec![String::new(); n];
            }
        }
    }

    /// Select rows in the given order. `index` values are carried unchanged.
    #[must_use]
    pub fn take(&self, rows: &[usize]) -> Control {
        Control {
            scet_coarse: rows.iter().map(|r| self.scet_coarse[*r]).collect(),
            scet_fine: rows.iter().map(|r| self.scet_fine[*r]).collect(),
            integration_time: rows.iter().map(|r| self.integration_time[*r]).collect(),
            index: rows.iter().map(|r| self.index[*r]).collect(),
            raw_file: rows.iter().map(|r| self.raw_file[*r].clone()).collect(),
            parent: rows.iter().map(|r| self.parent[*r].clone()).collect(),
            packet: rows.iter().map(|r| self.packet[*r].clone()).collect(),
            extra: self.extra.take(rows),
        }
    }

    /// Append the rows of `other`. `index` values are carried unchanged and may collide.
    ///
    /// # Errors
    /// [Error::Schema] if the extra columns differ.
    pub fn concat(&self, other: &Control) -> Result<Control> {
        fn join<T: Clone>(a: &[T], b: &[T]) -> Vec<T> {
            a.iter().chain(b).cloned().collect()
        }
        Ok(Control {
            scet_coarse: join(&self.scet_coarse, &other.scet_coarse),
            scet_fine: join(&self.scet_fine, &other.scet_fine),
            integration_time: join(&self.integration_time, &other.integration_time),
            index: join(&self.index, &other.index),
            raw_file: join(&self.raw_file, &other.raw_file),
            parent: join(&self.parent, &other.parent),
            packet: join(&self.packet, &other.packet),
            extra: self.extra.concat(&other.extra)?,
        })
    }

    /// Renumber `index` through `mapping` (old index to new index).
    pub(crate) fn remap_index(&mut self, mapping: &HashMap<usize, usize>) {
        for idx in &mut self.index {
            if let Some(new) = mapping.get(idx) {
                *idx = *new;
            }
        }
    }

    /// Check that all columns have one value per row and `index` is dense.
    ///
    /// # Errors
    /// [Error::Schema] for length mismatches and [Error::Integrity] for a non-dense index.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        let lengths = [
            ("scet_coarse", self.scet_coarse.len()),
            ("scet_fine", self.scet_fine.len()),
            ("integration_time", self.integration_time.len()),
            ("raw_file", self.raw_file.len()),
            ("parent", self.parent.len()),
            ("packet", self.packet.len()),
        ];
        for (name, len) in lengths {
            if len != n {
                return Err(Error::Schema(format!(
                    "control column {name} has {len} rows, expected {n}"
                )));
            }
        }
        if let Some(rows) = self.extra.rows()? {
            if rows != n {
                return Err(Error::Schema(format!(
                    "control extra columns have {rows} rows, expected {n}"
                )));
            }
        }
        let mut sorted = self.index.clone();
        sorted.sort_unstable();
        if sorted.iter().enumerate().any(|(i, idx)| i != *idx) {
            return Err(Error::Integrity(format!(
                "control index is not a dense 0..{n} numbering"
            )));
        }
        Ok(())
    }

    /// Sample centre times, durations and covered range for products whose packets carry
    /// `num_samples` consecutive samples of `integration_time` each.
    ///
    /// # Errors
    /// [Error::MissingTable] if there is no `num_samples` column.
    pub fn sample_times(&self) -> Result<(Vec<ScetTime>, Vec<ScetDelta>, ScetTimeRange)> {
        let Some(num_samples) = self.extra.get("num_samples") else {
            return Err(Error::MissingTable("control.num_samples".to_string()));
        };
        let mut times = Vec::new();
        let mut durations = Vec::new();
        let mut range = ScetTimeRange::default();
        for row in 0..self.len() {
            let base = self.scet(row);
            let duration = self.integration_time[row];
            let count = num_samples.values.u64_at(row).unwrap_or_default() as i64;
            for sample in 0..count {
                let start = base + duration * sample;
                times.push(start + duration / 2);
                durations.push(duration);
                range.expand(&ScetTimeRange::new(start, start + duration));
            }
        }
        Ok((times, durations, range))
    }

    /// Add a column of per-row unsigned values stored at the minimum width.
    pub fn add_uint(&mut self, name: &str, values: &[u64]) {
        self.extra.insert(Column::new(name, Values::min_uint(values)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(n: usize) -> Control {
        let mut control = Control {
            scet_coarse: (0..n as u32).map(|i| 100 + i).collect(),
            index: (0..n).collect(),
            ..Default::default()
        };
        control.fill_missing();
        control
    }

    #[test]
    fn fill_missing_zero_fills() {
        let c = control(3);
        assert_eq!(c.scet_fine, vec![0, 0, 0]);
        assert_eq!(c.integration_time, vec![ScetDelta::ZERO; 3]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_gaps() {
        let mut c = control(3);
        c.index = vec![0, 2, 3];
        assert!(matches!(c.validate(), Err(Error::Integrity(_))));
    }

    #[test]
    fn take_and_concat() {
        let c = control(3);
        let taken = c.take(&[2, 0]);
        assert_eq!(taken.scet_coarse, vec![102, 100]);
        assert_eq!(taken.index, vec![2, 0]);

        let joined = c.concat(&taken).unwrap();
        assert_eq!(joined.len(), 5);
        assert_eq!(joined.index, vec![0, 1, 2, 2, 0]);
    }

    #[test]
    fn sample_times_from_num_samples() {
        let mut c = control(2);
        c.integration_time = vec![ScetDelta::from_seconds(1.0); 2];
        c.add_uint("num_samples", &[2, 1]);
        let (times, durations, range) = c.sample_times().unwrap();
        let times: Vec<f64> = times.iter().map(ScetTime::as_float).collect();
        assert_eq!(times, vec![100.5, 101.5, 101.5]);
        assert_eq!(durations.len(), 3);
        assert_eq!(range.start.as_float(), 100.0);
        assert_eq!(range.end.as_float(), 102.0);

        assert!(matches!(
            control(1).sample_times(),
            Err(Error::MissingTable(_))
        ));
    }
}
