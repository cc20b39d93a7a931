//! Scramble catalog: which base tables have a scrambled (block-partitioned,
//! randomly shuffled) copy, and how much of the population each prefix of
//! blocks covers.
//!
//! The catalog is read-only once built and shared behind an `Arc`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::TableName;

const COVERAGE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrambleMeta {
    pub schema: String,
    pub table: String,
    /// Column holding the block number (0-based).
    pub block_column: String,
    pub block_count: u32,
    /// `coverage[i]` = fraction of the population in blocks `0..=i`.
    /// Empty means uniform.
    #[serde(default)]
    pub coverage: Vec<f64>,
}

impl ScrambleMeta {
    /// Metadata for a uniform scramble: every block holds the same share.
    pub fn uniform(
        schema: impl Into<String>,
        table: impl Into<String>,
        block_column: impl Into<String>,
        block_count: u32,
    ) -> Result<Self> {
        let meta = Self {
            schema: schema.into(),
            table: table.into(),
            block_column: block_column.into(),
            block_count,
            coverage: uniform_coverage(block_count),
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn with_coverage(
        schema: impl Into<String>,
        table: impl Into<String>,
        block_column: impl Into<String>,
        coverage: Vec<f64>,
    ) -> Result<Self> {
        let meta = Self {
            schema: schema.into(),
            table: table.into(),
            block_column: block_column.into(),
            block_count: coverage.len() as u32,
            coverage,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn name(&self) -> TableName {
        TableName::new(self.schema.clone(), self.table.clone())
    }

    /// Check block count and coverage; fills in uniform coverage when absent.
    pub fn validated(mut self) -> Result<Self> {
        if self.coverage.is_empty() {
            self.coverage = uniform_coverage(self.block_count);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let name = self.name();
        if self.block_count == 0 {
            return Err(Error::Catalog(format!("{name}: block_count must be > 0")));
        }
        if self.block_column.is_empty() {
            return Err(Error::Catalog(format!("{name}: empty block column")));
        }
        if self.coverage.len() != self.block_count as usize {
            return Err(Error::Catalog(format!(
                "{name}: {} coverage entries for {} blocks",
                self.coverage.len(),
                self.block_count
            )));
        }
        let mut prev = 0.0;
        for (i, &c) in self.coverage.iter().enumerate() {
            if !(c > 0.0 && c <= 1.0 + COVERAGE_EPSILON) || c + COVERAGE_EPSILON < prev {
                return Err(Error::Catalog(format!(
                    "{name}: coverage[{i}] = {c} is not cumulative in (0, 1]"
                )));
            }
            prev = c;
        }
        if (prev - 1.0).abs() > COVERAGE_EPSILON {
            return Err(Error::Catalog(format!(
                "{name}: final coverage is {prev}, expected 1"
            )));
        }
        Ok(())
    }

    /// Scale factor after the first `k` blocks (`1 <= k <= block_count`).
    pub fn scale_factor(&self, k: u32) -> Option<f64> {
        let idx = k.checked_sub(1)? as usize;
        self.coverage.get(idx).map(|c| 1.0 / c)
    }
}

fn uniform_coverage(block_count: u32) -> Vec<f64> {
    let n = f64::from(block_count);
    (1..=block_count).map(|i| f64::from(i) / n).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ScrambleMeta>", into = "Vec<ScrambleMeta>")]
pub struct ScrambleCatalog {
    entries: BTreeMap<TableName, ScrambleMeta>,
}

impl ScrambleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: ScrambleMeta) -> Result<()> {
        let meta = meta.validated()?;
        self.entries.insert(meta.name(), meta);
        Ok(())
    }

    pub fn with(mut self, meta: ScrambleMeta) -> Result<Self> {
        self.insert(meta)?;
        Ok(self)
    }

    pub fn get(&self, name: &TableName) -> Option<&ScrambleMeta> {
        self.entries.get(name)
    }

    pub fn lookup(&self, schema: &str, table: &str) -> Option<&ScrambleMeta> {
        self.get(&TableName::new(schema, table))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScrambleMeta> {
        self.entries.values()
    }
}

impl TryFrom<Vec<ScrambleMeta>> for ScrambleCatalog {
    type Error = Error;

    fn try_from(metas: Vec<ScrambleMeta>) -> Result<Self> {
        let mut catalog = ScrambleCatalog::new();
        for meta in metas {
            catalog.insert(meta)?;
        }
        Ok(catalog)
    }
}

impl From<ScrambleCatalog> for Vec<ScrambleMeta> {
    fn from(catalog: ScrambleCatalog) -> Self {
        catalog.entries.into_values().collect()
    }
}
