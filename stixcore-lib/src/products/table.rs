//! Columnar storage for the parameter columns of the Control and Data tables.
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Typed column values, flattened row-major. A column with `width > 1` stores `width`
/// consecutive elements per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum Values {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

macro_rules! map_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            Values::U8($v) => Values::U8($body),
            Values::U16($v) => Values::U16($body),
            Values::U32($v) => Values::U32($body),
            Values::U64($v) => Values::U64($body),
            Values::I64($v) => Values::I64($body),
            Values::F64($v) => Values::F64($body),
            Values::Bool($v) => Values::Bool($body),
            Values::Str($v) => Values::Str($body),
        }
    };
}

fn take_rows<T: Clone>(values: &[T], rows: &[usize], width: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len() * width);
    for row in rows {
        out.extend_from_slice(&values[row * width..(row + 1) * width]);
    }
    out
}

fn joined<T: Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

impl Values {
    /// Store `values` using the smallest unsigned type able to hold the largest value.
    #[must_use]
    pub fn min_uint(values: &[u64]) -> Self {
        let max = values.iter().copied().max().unwrap_or_default();
        if max < 1 << 8 {
            Values::U8(values.iter().map(|v| *v as u8).collect())
        } else if max < 1 << 16 {
            Values::U16(values.iter().map(|v| *v as u16).collect())
        } else if max < 1 << 32 {
            Values::U32(values.iter().map(|v| *v as u32).collect())
        } else {
            Values::U64(values.to_vec())
        }
    }

    /// Number of stored elements (rows times width).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Values::U8(v) => v.len(),
            Values::U16(v) => v.len(),
            Values::U32(v) => v.len(),
            Values::U64(v) => v.len(),
            Values::I64(v) => v.len(),
            Values::F64(v) => v.len(),
            Values::Bool(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> &'static str {
        match self {
            Values::U8(_) => "u8",
            Values::U16(_) => "u16",
            Values::U32(_) => "u32",
            Values::U64(_) => "u64",
            Values::I64(_) => "i64",
            Values::F64(_) => "f64",
            Values::Bool(_) => "bool",
            Values::Str(_) => "str",
        }
    }

    #[must_use]
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Values::U8(_) | Values::U16(_) | Values::U32(_) | Values::U64(_)
        )
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Values::Bool(_) | Values::Str(_))
    }

    /// Element `i` as an unsigned integer, if the column is integral and the value is
    /// non-negative.
    #[must_use]
    pub fn u64_at(&self, i: usize) -> Option<u64> {
        match self {
            Values::U8(v) => v.get(i).map(|x| u64::from(*x)),
            Values::U16(v) => v.get(i).map(|x| u64::from(*x)),
            Values::U32(v) => v.get(i).map(|x| u64::from(*x)),
            Values::U64(v) => v.get(i).copied(),
            Values::I64(v) => v.get(i).and_then(|x| u64::try_from(*x).ok()),
            Values::Bool(v) => v.get(i).map(|x| u64::from(*x)),
            Values::F64(_) | Values::Str(_) => None,
        }
    }

    #[must_use]
    pub fn f64_at(&self, i: usize) -> Option<f64> {
        match self {
            Values::F64(v) => v.get(i).copied(),
            Values::I64(v) => v.get(i).map(|x| *x as f64),
            Values::Str(_) => None,
            _ => self.u64_at(i).map(|x| x as f64),
        }
    }

    #[must_use]
    pub fn str_at(&self, i: usize) -> Option<&str> {
        match self {
            Values::Str(v) => v.get(i).map(String::as_str),
            _ => None,
        }
    }

    /// All elements as unsigned integers, or `None` for float, negative or string data.
    #[must_use]
    pub fn to_u64(&self) -> Option<Vec<u64>> {
        (0..self.len()).map(|i| self.u64_at(i)).collect()
    }

    /// All elements as floats, or `None` for string data.
    #[must_use]
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        (0..self.len()).map(|i| self.f64_at(i)).collect()
    }

    /// Select rows of `width` elements in the given order.
    ///
    /// # Panics
    /// If any row is out of bounds.
    #[must_use]
    pub fn take(&self, rows: &[usize], width: usize) -> Values {
        map_values!(self, v => take_rows(v, rows, width))
    }

    /// Concatenate `other` after `self`.
    ///
    /// Unsigned columns of different widths are joined at the smallest common width (mirrors
    /// the minimum-width storage used when building columns); otherwise numeric columns of
    /// different types are joined as floats.
    ///
    /// # Errors
    /// [Error::Schema] if the columns cannot be joined.
    pub fn concat(&self, other: &Values) -> Result<Values> {
        let values = match (self, other) {
            (Values::U8(a), Values::U8(b)) => Values::U8(joined(a, b)),
            (Values::U16(a), Values::U16(b)) => Values::U16(joined(a, b)),
            (Values::U32(a), Values::U32(b)) => Values::U32(joined(a, b)),
            (Values::U64(a), Values::U64(b)) => Values::U64(joined(a, b)),
            (Values::I64(a), Values::I64(b)) => Values::I64(joined(a, b)),
            (Values::F64(a), Values::F64(b)) => Values::F64(joined(a, b)),
            (Values::Bool(a), Values::Bool(b)) => Values::Bool(joined(a, b)),
            (Values::Str(a), Values::Str(b)) => Values::Str(joined(a, b)),
            (a, b) if a.is_unsigned() && b.is_unsigned() => {
                let a = a.to_u64().unwrap_or_default();
                let b = b.to_u64().unwrap_or_default();
                Values::min_uint(&joined(&a, &b))
            }
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let a = a.to_f64().unwrap_or_default();
                let b = b.to_f64().unwrap_or_default();
                Values::F64(joined(&a, &b))
            }
            (a, b) => {
                return Err(Error::Schema(format!(
                    "cannot concatenate {} and {} columns",
                    a.dtype(),
                    b.dtype()
                )))
            }
        };
        Ok(values)
    }
}

/// Parameter metadata carried with a column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamMeta {
    /// Raw IDB parameter id, e.g., `NIX00445`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nix: Option<String>,
    /// Calibration curve reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curtx: Option<String>,
}

fn default_width() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Values,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub meta: ParamMeta,
}

impl Column {
    #[must_use]
    pub fn new(name: &str, values: Values) -> Self {
        Self {
            name: name.to_string(),
            values,
            width: 1,
            unit: None,
            meta: ParamMeta::default(),
        }
    }

    #[must_use]
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    #[must_use]
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: ParamMeta) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.values.len() / self.width.max(1)
    }

    #[must_use]
    pub fn take(&self, rows: &[usize]) -> Column {
        Column {
            values: self.values.take(rows, self.width),
            ..self.clone_empty()
        }
    }

    fn clone_empty(&self) -> Column {
        Column {
            name: self.name.clone(),
            values: Values::U8(Vec::new()),
            width: self.width,
            unit: self.unit.clone(),
            meta: self.meta.clone(),
        }
    }

    /// # Errors
    /// [Error::Schema] if the row widths or value types are incompatible.
    pub fn concat(&self, other: &Column) -> Result<Column> {
        if self.width != other.width {
            return Err(Error::Schema(format!(
                "column {} has width {} and {}",
                self.name, self.width, other.width
            )));
        }
        Ok(Column {
            values: self
                .values
                .concat(&other.values)
                .map_err(|e| Error::Schema(format!("column {}: {e}", self.name)))?,
            ..self.clone_empty()
        })
    }
}

/// Ordered collection of named columns that all have the same number of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Columns(Vec<Column>);

impl Columns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Column> {
        self.0.iter_mut()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.0.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a column, replacing any existing column with the same name in place.
    pub fn insert(&mut self, column: Column) {
        match self.0.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.0.push(column),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let pos = self.0.iter().position(|c| c.name == name)?;
        Some(self.0.remove(pos))
    }

    /// Row count shared by all columns, `None` if there are no columns.
    ///
    /// # Errors
    /// [Error::Schema] if columns have different row counts.
    pub fn rows(&self) -> Result<Option<usize>> {
        let mut rows = None;
        for col in &self.0 {
            match rows {
                None => rows = Some(col.rows()),
                Some(n) if n != col.rows() => {
                    return Err(Error::Schema(format!(
                        "column {} has {} rows, expected {n}",
                        col.name,
                        col.rows()
                    )))
                }
                _ => {}
            }
        }
        Ok(rows)
    }

    #[must_use]
    pub fn take(&self, rows: &[usize]) -> Columns {
        Columns(self.0.iter().map(|c| c.take(rows)).collect())
    }

    /// Concatenate rows of `other` after `self`. Both must have the same column names; the
    /// column order of `self` is kept.
    ///
    /// # Errors
    /// [Error::Schema] if the column sets differ or a column pair cannot be joined.
    pub fn concat(&self, other: &Columns) -> Result<Columns> {
        if self.len() != other.len() {
            return Err(Error::Schema(format!(
                "column sets differ: {:?} and {:?}",
                self.names(),
                other.names()
            )));
        }
        let mut out = Vec::with_capacity(self.len());
        for col in &self.0 {
            let Some(theirs) = other.get(&col.name) else {
                return Err(Error::Schema(format!("missing column {}", col.name)));
            };
            out.push(col.concat(theirs)?);
        }
        Ok(Columns(out))
    }
}

impl From<Vec<Column>> for Columns {
    fn from(value: Vec<Column>) -> Self {
        Columns(value)
    }
}

impl FromIterator<Column> for Columns {
    fn from_iter<T: IntoIterator<Item = Column>>(iter: T) -> Self {
        Columns(iter.into_iter().collect())
    }
}
