//! Core domain model for the exchange inventory tracker.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "invtrack-core";

/// Cell format for every data-date key written to a sheet.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A value reported for one source-owned slot.
///
/// A field that is not reported at all is modelled as `Option::None` on the
/// record; `Blank` is the explicit instruction to clear a slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Value(f64),
    Blank,
}

impl Reading {
    pub fn value(self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::Blank => None,
        }
    }

    /// Cell text this reading writes into a slot.
    pub fn to_cell(self) -> String {
        match self {
            Reading::Value(v) => format_number(v),
            Reading::Blank => String::new(),
        }
    }
}

/// Normalized snapshot handed from one feed run to the summary engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub data_date: NaiveDate,
    pub total: Option<Reading>,
    pub change: Option<Reading>,
    #[serde(default)]
    pub extras: BTreeMap<String, Reading>,
}

impl SourceRecord {
    pub fn new(source_id: impl Into<String>, data_date: NaiveDate) -> Self {
        Self {
            source_id: source_id.into(),
            data_date,
            total: None,
            change: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_total(mut self, total_mt: f64) -> Self {
        self.total = Some(Reading::Value(total_mt));
        self
    }

    pub fn with_change(mut self, change_mt: f64) -> Self {
        self.change = Some(Reading::Value(change_mt));
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extras.insert(name.into(), Reading::Value(value));
        self
    }

    pub fn blank_total(mut self) -> Self {
        self.total = Some(Reading::Blank);
        self
    }

    pub fn blank_change(mut self) -> Self {
        self.change = Some(Reading::Blank);
        self
    }

    pub fn blank_extra(mut self, name: impl Into<String>) -> Self {
        self.extras.insert(name.into(), Reading::Blank);
        self
    }

    /// The row key this record merges into.
    pub fn date_key(&self) -> String {
        format_date(self.data_date)
    }

    pub fn total_value(&self) -> Option<f64> {
        self.total.and_then(Reading::value)
    }

    pub fn change_value(&self) -> Option<f64> {
        self.change.and_then(Reading::value)
    }
}

/// Empty-tolerant numeric cell parser shared by every calculation.
///
/// Blank, non-numeric and non-finite cells are absent. Thousands separators
/// and a leading `+` are accepted.
pub fn parse_numeric_cell(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Shortest cell text for a quantity; integral values carry no fraction.
pub fn format_number(value: f64) -> String {
    // avoid writing "-0" for deltas that round to zero
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{value}")
}

pub fn format_fixed(value: f64, decimals: usize) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{value:.decimals$}")
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date_cell(cell: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(cell.trim(), DATE_FORMAT).ok()
}
