use serde::{Deserialize, Serialize};

use super::table::Columns;
use crate::time::{ScetDelta, ScetTime, ScetTimeRange};
use crate::{Error, Result};

/// Per sample measurements of a product. Each row references its owning Control row through
/// `control_index`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub time: Vec<ScetTime>,
    pub timedel: Vec<ScetDelta>,
    pub control_index: Vec<usize>,
    #[serde(default)]
    pub columns: Columns,
}

impl Data {
    #[must_use]
    pub fn len(&self) -> usize {
        self.control_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.control_index.is_empty()
    }

    /// Range from the start of the first sample to the end of the last sample, assuming rows
    /// are in time order.
    #[must_use]
    pub fn scet_timerange(&self) -> ScetTimeRange {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => {
                let first_del = self.timedel.first().copied().unwrap_or_default();
                let last_del = self.timedel.last().copied().unwrap_or_default();
                ScetTimeRange::new(*first - first_del / 2, *last + last_del / 2)
            }
            _ => ScetTimeRange::default(),
        }
    }

    #[must_use]
    pub fn take(&self, rows: &[usize]) -> Data {
        Data {
            time: rows.iter().map(|r| self.time[*r]).collect(),
            timedel: rows.iter().map(|r| self.timedel[*r]).collect(),
            control_index: rows.iter().map(|r| self.control_index[*r]).collect(),
            columns: self.columns.take(rows),
        }
    }

    /// # Errors
    /// [Error::Schema] if the parameter columns differ.
    pub fn concat(&self, other: &Data) -> Result<Data> {
        Ok(Data {
            time: self.time.iter().chain(&other.time).copied().collect(),
            timedel: self.timedel.iter().chain(&other.timedel).copied().collect(),
            control_index: self
                .control_index
                .iter()
                .chain(&other.control_index)
                .copied()
                .collect(),
            columns: self.columns.concat(&other.columns)?,
        })
    }

    /// Zero-fill `time` and `timedel` when they were not stored, as for level binary data.
    pub fn fill_missing(&mut self) {
        let n = self.len();
        if self.time.is_empty() {
            self.time = vec![ScetTime::MIN; n];
        }
        if self.timedel.is_empty() {
            self.timedel = vec![ScetDelta::ZERO; n];
        }
    }

    /// # Errors
    /// [Error::Schema] if a column does not have one value per row.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        for (name, len) in [("time", self.time.len()), ("timedel", self.timedel.len())] {
            if len != n {
                return Err(Error::Schema(format!(
                    "data column {name} has {len} rows, expected {n}"
                )));
            }
        }
        if let Some(rows) = self.columns.rows()? {
            if rows != n {
                return Err(Error::Schema(format!(
                    "data columns have {rows} rows, expected {n}"
                )));
            }
        }
        Ok(())
    }
}
