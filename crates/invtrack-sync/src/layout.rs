//! Summary sheet layout: which column each source owns, which columns are
//! derived, and which are reserved for manual entry.
//!
//! Layouts are declared in YAML by header name and resolved once into
//! 0-based column indices. Every column must have exactly one role.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use invtrack_feeds::SourceLogSpec;
use serde::Deserialize;
use thiserror::Error;

const COPPER_LAYOUT: &str = include_str!("../layouts/copper.yaml");

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("reading layout {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing layout: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{role} refers to unknown column {name:?}")]
    UnknownColumn { role: String, name: String },
    #[error("header {0:?} appears more than once")]
    DuplicateHeader(String),
    #[error("column {column:?} is claimed by both {first} and {second}")]
    ColumnClaimedTwice {
        column: String,
        first: String,
        second: String,
    },
    #[error("column {0:?} has no role")]
    UnassignedColumn(String),
    #[error("source {0:?} is declared more than once")]
    DuplicateSource(String),
    #[error("layout declares no sources")]
    NoSources,
    #[error("ratio {output:?} reads derived column {input:?}")]
    RatioOverDerived { output: String, input: String },
}

#[derive(Debug, Deserialize)]
struct LayoutFile {
    sheet: String,
    date_column: String,
    columns: Vec<String>,
    sources: Vec<SourceEntry>,
    #[serde(default)]
    manual: Vec<String>,
    #[serde(default)]
    ratios: Vec<RatioEntry>,
    combined_total: String,
    combined_change: String,
    week_over_week: String,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    source_id: String,
    total: String,
    change: String,
    #[serde(default)]
    extras: BTreeMap<String, String>,
    #[serde(default)]
    log: Option<SourceLogSpec>,
}

#[derive(Debug, Deserialize)]
struct RatioEntry {
    numerator: String,
    denominator: String,
    output: String,
}

/// Columns exclusively written by one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSlots {
    pub source_id: String,
    pub total: usize,
    pub change: usize,
    pub extras: BTreeMap<String, usize>,
    pub log: Option<SourceLogSpec>,
}

/// `output = round(numerator / denominator * 100, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatioSlot {
    pub numerator: usize,
    pub denominator: usize,
    pub output: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardLayout {
    sheet: String,
    headers: Vec<String>,
    date: usize,
    sources: Vec<SourceSlots>,
    manual: Vec<usize>,
    ratios: Vec<RatioSlot>,
    combined_total: usize,
    combined_change: usize,
    week_over_week: usize,
}

impl DashboardLayout {
    /// The built-in COMEX/LME/SHFE copper dashboard.
    pub fn copper() -> Self {
        Self::from_yaml_str(COPPER_LAYOUT).expect("built-in copper layout is valid")
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, LayoutError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LayoutError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, LayoutError> {
        let mut file: LayoutFile = serde_yaml::from_str(text)?;
        let columns = std::mem::take(&mut file.columns);
        Resolver::new(columns)?.resolve(file)
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Number of columns every summary row is padded to.
    pub fn width(&self) -> usize {
        self.headers.len()
    }

    pub fn date_column(&self) -> usize {
        self.date
    }

    pub fn sources(&self) -> &[SourceSlots] {
        &self.sources
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceSlots> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id.as_str()).collect()
    }

    pub fn manual_columns(&self) -> &[usize] {
        &self.manual
    }

    pub fn ratios(&self) -> &[RatioSlot] {
        &self.ratios
    }

    pub fn combined_total(&self) -> usize {
        self.combined_total
    }

    pub fn combined_change(&self) -> usize {
        self.combined_change
    }

    pub fn week_over_week(&self) -> usize {
        self.week_over_week
    }

    /// Columns the engine recomputes on every upsert.
    pub fn derived_columns(&self) -> Vec<usize> {
        let mut columns: Vec<usize> = self.ratios.iter().map(|r| r.output).collect();
        columns.extend([self.combined_total, self.combined_change, self.week_over_week]);
        columns
    }
}

struct Resolver {
    positions: HashMap<String, usize>,
    owners: Vec<Option<String>>,
    headers: Vec<String>,
}

impl Resolver {
    fn new(headers: Vec<String>) -> Result<Self, LayoutError> {
        let mut positions = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            if positions.insert(header.clone(), i).is_some() {
                return Err(LayoutError::DuplicateHeader(header.clone()));
            }
        }
        Ok(Self {
            positions,
            owners: vec![None; headers.len()],
            headers,
        })
    }

    fn lookup(&self, role: &str, name: &str) -> Result<usize, LayoutError> {
        self.positions
            .get(name)
            .copied()
            .ok_or_else(|| LayoutError::UnknownColumn {
                role: role.to_string(),
                name: name.to_string(),
            })
    }

    fn claim(&mut self, role: String, name: &str) -> Result<usize, LayoutError> {
        let index = self.lookup(&role, name)?;
        if let Some(first) = &self.owners[index] {
            return Err(LayoutError::ColumnClaimedTwice {
                column: name.to_string(),
                first: first.clone(),
                second: role,
            });
        }
        self.owners[index] = Some(role);
        Ok(index)
    }

    fn resolve(mut self, file: LayoutFile) -> Result<DashboardLayout, LayoutError> {
        let date = self.claim("date".to_string(), &file.date_column)?;

        if file.sources.is_empty() {
            return Err(LayoutError::NoSources);
        }
        let mut sources: Vec<SourceSlots> = Vec::with_capacity(file.sources.len());
        for entry in file.sources {
            if sources.iter().any(|s| s.source_id == entry.source_id) {
                return Err(LayoutError::DuplicateSource(entry.source_id));
            }
            let id = entry.source_id;
            let total = self.claim(format!("{id} total"), &entry.total)?;
            let change = self.claim(format!("{id} change"), &entry.change)?;
            let mut extras = BTreeMap::new();
            for (name, column) in &entry.extras {
                let index = self.claim(format!("{id} extra {name}"), column)?;
                extras.insert(name.clone(), index);
            }
            sources.push(SourceSlots {
                source_id: id,
                total,
                change,
                extras,
                log: entry.log,
            });
        }

        let mut manual = Vec::with_capacity(file.manual.len());
        for name in &file.manual {
            manual.push(self.claim("manual entry".to_string(), name)?);
        }

        let mut outputs = Vec::with_capacity(file.ratios.len());
        for ratio in &file.ratios {
            outputs.push(self.claim(format!("ratio {}", ratio.output), &ratio.output)?);
        }
        let combined_total = self.claim("combined total".to_string(), &file.combined_total)?;
        let combined_change = self.claim("combined change".to_string(), &file.combined_change)?;
        let week_over_week = self.claim("week over week".to_string(), &file.week_over_week)?;

        let derived: Vec<usize> = outputs
            .iter()
            .copied()
            .chain([combined_total, combined_change, week_over_week])
            .collect();
        let mut ratios = Vec::with_capacity(file.ratios.len());
        for (ratio, output) in file.ratios.iter().zip(outputs) {
            let role = format!("ratio {}", ratio.output);
            let numerator = self.lookup(&role, &ratio.numerator)?;
            let denominator = self.lookup(&role, &ratio.denominator)?;
            for (input, name) in [(numerator, &ratio.numerator), (denominator, &ratio.denominator)] {
                if derived.contains(&input) {
                    return Err(LayoutError::RatioOverDerived {
                        output: ratio.output.clone(),
                        input: name.clone(),
                    });
                }
            }
            ratios.push(RatioSlot {
                numerator,
                denominator,
                output,
            });
        }

        if let Some(i) = self.owners.iter().position(Option::is_none) {
            return Err(LayoutError::UnassignedColumn(self.headers[i].clone()));
        }

        Ok(DashboardLayout {
            sheet: file.sheet,
            headers: self.headers,
            date,
            sources,
            manual,
            ratios,
            combined_total,
            combined_change,
            week_over_week,
        })
    }
}
