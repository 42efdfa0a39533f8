//! Feed snapshot contracts: what an exchange feed hands to the sync pipeline.
//!
//! Fetching and parsing exchange pages happens upstream; a feed only has to
//! produce a [`FeedSnapshot`]. This crate normalizes snapshots into
//! [`SourceRecord`]s and shapes the rows of each exchange's own detail log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use invtrack_core::{format_date, format_number, round_to, Reading, SourceRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "invtrack-feeds";

pub const SHORT_TON_IN_METRIC_TONNES: f64 = 0.907185;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot has no source_id")]
    MissingSourceId,
    #[error("unrecognized report date {0:?}")]
    UnparseableDate(String),
    #[error("field {0:?} is both reported and cleared")]
    ConflictingField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    MetricTonnes,
    ShortTons,
}

impl Unit {
    /// Short tons convert to whole metric tonnes.
    pub fn to_metric_tonnes(self, value: f64) -> f64 {
        match self {
            Unit::MetricTonnes => value,
            Unit::ShortTons => round_to(value * SHORT_TON_IN_METRIC_TONNES, 0),
        }
    }
}

/// Parsed output of one feed run, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub source_id: String,
    /// Report or activity date as published by the exchange.
    pub data_date: String,
    /// Publication date, when the exchange reports it apart from `data_date`.
    #[serde(default)]
    pub report_date: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub extras: BTreeMap<String, f64>,
    /// Breakdown values recorded only in the source log (e.g. per region).
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
    /// Slots to blank explicitly: `total`, `change` or an extra name.
    #[serde(default)]
    pub clear: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl FeedSnapshot {
    pub fn to_record(&self) -> Result<SourceRecord, FeedError> {
        let source_id = self.source_id.trim();
        if source_id.is_empty() {
            return Err(FeedError::MissingSourceId);
        }
        let data_date = parse_report_date(&self.data_date)?;
        if let Some(report_date) = &self.report_date {
            parse_report_date(report_date)?;
        }
        let mut record = SourceRecord::new(source_id, data_date);

        if let Some(total) = self.total {
            record = record.with_total(self.unit.to_metric_tonnes(total));
        }
        if let Some(change) = self.change {
            record = record.with_change(self.unit.to_metric_tonnes(change));
        }
        for (name, value) in &self.extras {
            record = record.with_extra(name.clone(), self.unit.to_metric_tonnes(*value));
        }

        for name in &self.clear {
            let reported = match name.as_str() {
                "total" => self.total.is_some(),
                "change" => self.change.is_some(),
                other => self.extras.contains_key(other),
            };
            if reported {
                return Err(FeedError::ConflictingField(name.clone()));
            }
            record = match name.as_str() {
                "total" => record.blank_total(),
                "change" => record.blank_change(),
                other => record.blank_extra(other),
            };
        }

        Ok(record)
    }

    /// Day the snapshot was fetched; today when the feed did not say.
    pub fn fetched_on(&self) -> NaiveDate {
        self.fetched_at.unwrap_or_else(Utc::now).date_naive()
    }

    /// Value exactly as published, before unit conversion: `total`,
    /// `change` or an extra name.
    pub fn published(&self, name: &str) -> Option<f64> {
        match name {
            "total" => self.total,
            "change" => self.change,
            other => self.extras.get(other).copied(),
        }
    }

    /// Detail value converted to metric tonnes.
    pub fn detail_mt(&self, name: &str) -> Option<f64> {
        self.details
            .get(name)
            .map(|v| self.unit.to_metric_tonnes(*v))
    }
}

/// Normalizes the date spellings the exchanges publish.
///
/// Accepts `2026-02-24`, `02/24/2026`, `20260224` and `24. February 2026`.
pub fn parse_report_date(raw: &str) -> Result<NaiveDate, FeedError> {
    let trimmed = raw.trim();

    if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let year = trimmed[..4].parse().ok();
        let month = trimmed[4..6].parse().ok();
        let day = trimmed[6..].parse().ok();
        if let (Some(y), Some(m), Some(d)) = (year, month, day) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                return Ok(date);
            }
        }
        return Err(FeedError::UnparseableDate(raw.to_string()));
    }

    for format in ["%Y-%m-%d", "%m/%d/%Y", "%d. %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }
    Err(FeedError::UnparseableDate(raw.to_string()))
}

/// Interface to the upstream fetch+parse collaborator of one feed.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError>;
}

/// Snapshot captured to disk as JSON.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotSource for FixtureSource {
    fn describe(&self) -> String {
        format!("fixture {}", self.path.display())
    }

    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, FeedError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| FeedError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| FeedError::Json {
            path: self.path.clone(),
            source,
        })
    }
}

pub const RUN_DATE_HEADER: &str = "Date";
pub const TOTAL_HEADER: &str = "Total (mt)";
pub const CHANGE_HEADER: &str = "Change (mt)";
pub const SOURCE_HEADER: &str = "Source";

/// Where a log column beyond total and change takes its value from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogValue {
    /// Record extra, metric tonnes.
    #[default]
    Extra,
    /// Snapshot value in its published unit.
    Published,
    /// Snapshot detail, metric tonnes.
    Detail,
    /// Total less the listed details that are present.
    Remainder,
    /// Snapshot report date, ISO formatted.
    ReportDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogExtra {
    pub name: String,
    pub header: String,
    #[serde(default)]
    pub from: LogValue,
    /// Detail names subtracted by a `remainder` column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<String>,
}

impl LogExtra {
    fn cell(&self, record: &SourceRecord, snapshot: &FeedSnapshot) -> Result<String, FeedError> {
        let number = |v: Option<f64>| v.map(format_number).unwrap_or_default();
        Ok(match self.from {
            LogValue::Extra => record
                .extras
                .get(&self.name)
                .map(|r| r.to_cell())
                .unwrap_or_default(),
            LogValue::Published => number(snapshot.published(&self.name)),
            LogValue::Detail => number(snapshot.detail_mt(&self.name)),
            LogValue::Remainder => {
                let known: Vec<f64> = self
                    .parts
                    .iter()
                    .filter_map(|p| snapshot.detail_mt(p))
                    .collect();
                match record.total_value() {
                    Some(total) if !known.is_empty() => {
                        format_number(round_to(total - known.iter().sum::<f64>(), 0))
                    }
                    _ => String::new(),
                }
            }
            LogValue::ReportDate => match &snapshot.report_date {
                Some(raw) => format_date(parse_report_date(raw)?),
                None => String::new(),
            },
        })
    }
}

/// Shape of one exchange's append-only detail log:
/// `Date | <key> | Total (mt) | Change (mt) | <extras…> | Source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLogSpec {
    pub sheet: String,
    pub key_header: String,
    #[serde(default)]
    pub extras: Vec<LogExtra>,
    /// The exchange publishes no daily change; derive it from this log.
    #[serde(default)]
    pub derive_change: bool,
}

impl SourceLogSpec {
    pub const KEY_COLUMN: usize = 2;
    pub const TOTAL_COLUMN: usize = 3;

    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec![
            RUN_DATE_HEADER.to_string(),
            self.key_header.clone(),
            TOTAL_HEADER.to_string(),
            CHANGE_HEADER.to_string(),
        ];
        headers.extend(self.extras.iter().map(|e| e.header.clone()));
        headers.push(SOURCE_HEADER.to_string());
        headers
    }

    /// Natural key of a record in this log.
    pub fn key_for(&self, record: &SourceRecord) -> String {
        record.date_key()
    }

    /// Log row for `record`, normalized from `snapshot` (its change may have
    /// been derived since).
    pub fn row(
        &self,
        run_date: NaiveDate,
        record: &SourceRecord,
        snapshot: &FeedSnapshot,
    ) -> Result<Vec<String>, FeedError> {
        let cell = |reading: Option<Reading>| reading.map(Reading::to_cell).unwrap_or_default();

        let mut row = vec![
            format_date(run_date),
            self.key_for(record),
            cell(record.total),
            cell(record.change),
        ];
        for extra in &self.extras {
            row.push(extra.cell(record, snapshot)?);
        }
        row.push(snapshot.source_url.clone().unwrap_or_default());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_path(source: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(source)
            .join("sample")
            .join("snapshot.json")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn column(name: &str, header: &str, from: LogValue) -> LogExtra {
        LogExtra {
            name: name.into(),
            header: header.into(),
            from,
            parts: Vec::new(),
        }
    }

    fn comex_log() -> SourceLogSpec {
        SourceLogSpec {
            sheet: "COMEX".into(),
            key_header: "Activity Date".into(),
            extras: vec![
                column("report_date", "Report Date", LogValue::ReportDate),
                column("total", "Total (st)", LogValue::Published),
                column("registered", "Registered (st)", LogValue::Published),
                column("registered", "Registered (mt)", LogValue::Extra),
                column("eligible", "Eligible (mt)", LogValue::Extra),
            ],
            derive_change: true,
        }
    }

    fn shfe_log() -> SourceLogSpec {
        let regions = ["shanghai", "guangdong", "jiangsu", "zhejiang"];
        let mut extras: Vec<LogExtra> = regions
            .iter()
            .map(|r| column(r, r, LogValue::Detail))
            .collect();
        extras.push(LogExtra {
            parts: regions.iter().map(|r| r.to_string()).collect(),
            ..column("other", "Other Regions (mt)", LogValue::Remainder)
        });
        SourceLogSpec {
            sheet: "SHFE".into(),
            key_header: "Report Date".into(),
            extras,
            derive_change: false,
        }
    }

    #[test]
    fn report_dates_in_every_published_spelling() {
        assert_eq!(parse_report_date("2026-02-24").unwrap(), date(2026, 2, 24));
        assert_eq!(parse_report_date("02/24/2026").unwrap(), date(2026, 2, 24));
        assert_eq!(parse_report_date(" 20260224 ").unwrap(), date(2026, 2, 24));
        assert_eq!(parse_report_date("24. February 2026").unwrap(), date(2026, 2, 24));
        assert!(matches!(
            parse_report_date("20261340"),
            Err(FeedError::UnparseableDate(_))
        ));
        assert!(matches!(
            parse_report_date(""),
            Err(FeedError::UnparseableDate(_))
        ));
    }

    #[test]
    fn short_tons_convert_to_whole_metric_tonnes() {
        assert_eq!(Unit::ShortTons.to_metric_tonnes(330_690.0), 299_997.0);
        assert_eq!(Unit::MetricTonnes.to_metric_tonnes(12_345.5), 12_345.5);
    }

    #[test]
    fn snapshot_clears_become_explicit_blanks() {
        let snapshot = FeedSnapshot {
            source_id: " LME ".into(),
            data_date: "2026-02-24".into(),
            unit: Unit::MetricTonnes,
            total: Some(200_000.0),
            clear: vec!["change".into()],
            ..FeedSnapshot::default()
        };
        let record = snapshot.to_record().unwrap();
        assert_eq!(record.source_id, "LME");
        assert_eq!(record.total, Some(Reading::Value(200_000.0)));
        assert_eq!(record.change, Some(Reading::Blank));
    }

    #[test]
    fn snapshot_rejects_a_field_both_reported_and_cleared() {
        let snapshot = FeedSnapshot {
            source_id: "LME".into(),
            data_date: "2026-02-24".into(),
            unit: Unit::MetricTonnes,
            total: Some(1.0),
            clear: vec!["total".into()],
            ..FeedSnapshot::default()
        };
        assert!(matches!(
            snapshot.to_record(),
            Err(FeedError::ConflictingField(f)) if f == "total"
        ));

        let nameless = FeedSnapshot {
            source_id: "  ".into(),
            clear: Vec::new(),
            ..snapshot
        };
        assert!(matches!(nameless.to_record(), Err(FeedError::MissingSourceId)));
    }

    #[test]
    fn log_rows_follow_the_declared_headers() {
        let log = comex_log();
        assert_eq!(
            log.headers(),
            vec![
                "Date",
                "Activity Date",
                "Total (mt)",
                "Change (mt)",
                "Report Date",
                "Total (st)",
                "Registered (st)",
                "Registered (mt)",
                "Eligible (mt)",
                "Source"
            ]
        );

        let snapshot = FeedSnapshot {
            source_id: "COMEX".into(),
            data_date: "02/24/2026".into(),
            report_date: Some("02/25/2026".into()),
            unit: Unit::ShortTons,
            total: Some(330_690.0),
            extras: BTreeMap::from([("eligible".to_string(), 248_018.0)]),
            source_url: Some("https://example.test/stocks.xls".into()),
            ..FeedSnapshot::default()
        };
        let record = snapshot.to_record().unwrap();
        let row = log.row(date(2026, 2, 25), &record, &snapshot).unwrap();
        assert_eq!(
            row,
            vec![
                "2026-02-25",
                "2026-02-24",
                "299997",
                "",
                "2026-02-25",
                "330690",
                "",
                "",
                "224998",
                "https://example.test/stocks.xls"
            ]
        );
        assert_eq!(row.len(), log.headers().len());
    }

    #[test]
    fn regional_remainder_is_total_less_known_regions() {
        let log = shfe_log();
        let snapshot = FeedSnapshot {
            source_id: "SHFE".into(),
            data_date: "20260224".into(),
            total: Some(150_000.0),
            details: BTreeMap::from([
                ("shanghai".to_string(), 60_000.0),
                ("guangdong".to_string(), 40_000.0),
                ("zhejiang".to_string(), 15_000.0),
            ]),
            ..FeedSnapshot::default()
        };
        let record = snapshot.to_record().unwrap();
        let row = log.row(date(2026, 2, 25), &record, &snapshot).unwrap();
        assert_eq!(&row[4..9], &["60000", "40000", "", "15000", "35000"]);

        let no_regions = FeedSnapshot {
            details: BTreeMap::new(),
            ..snapshot.clone()
        };
        let row = log.row(date(2026, 2, 25), &record, &no_regions).unwrap();
        assert_eq!(row[8], "");

        let no_total = SourceRecord::new("SHFE", date(2026, 2, 24));
        let row = log.row(date(2026, 2, 25), &no_total, &snapshot).unwrap();
        assert_eq!(row[8], "");
    }

    #[test]
    fn unreadable_report_date_fails_normalization() {
        let snapshot = FeedSnapshot {
            source_id: "COMEX".into(),
            data_date: "02/24/2026".into(),
            report_date: Some("tomorrow".into()),
            ..FeedSnapshot::default()
        };
        assert!(matches!(
            snapshot.to_record(),
            Err(FeedError::UnparseableDate(d)) if d == "tomorrow"
        ));
    }

    #[test]
    fn fetched_on_uses_the_fetch_timestamp() {
        let snapshot = FeedSnapshot {
            fetched_at: Some("2026-02-25T23:30:00Z".parse().unwrap()),
            ..FeedSnapshot::default()
        };
        assert_eq!(snapshot.fetched_on(), date(2026, 2, 25));
    }

    #[tokio::test]
    async fn comex_fixture_normalizes_to_metric_tonnes() {
        let source = FixtureSource::new(fixture_path("comex"));
        let snapshot = source.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.unit, Unit::ShortTons);

        let record = snapshot.to_record().unwrap();
        assert_eq!(record.source_id, "COMEX");
        assert_eq!(record.data_date, date(2026, 2, 24));
        assert_eq!(record.total_value(), Some(299_997.0));
        assert_eq!(record.change, None);
        assert_eq!(record.extras.get("registered"), Some(&Reading::Value(74_999.0)));
        assert_eq!(record.extras.get("eligible"), Some(&Reading::Value(224_998.0)));
    }

    #[tokio::test]
    async fn lme_and_shfe_fixtures_carry_their_own_change() {
        let lme = FixtureSource::new(fixture_path("lme"))
            .fetch_snapshot()
            .await
            .unwrap()
            .to_record()
            .unwrap();
        assert_eq!(lme.data_date, date(2026, 2, 24));
        assert_eq!(lme.change_value(), Some(-1_250.0));

        let shfe = FixtureSource::new(fixture_path("shfe"))
            .fetch_snapshot()
            .await
            .unwrap()
            .to_record()
            .unwrap();
        assert_eq!(shfe.data_date, date(2026, 2, 24));
        assert_eq!(shfe.total_value(), Some(150_000.0));
    }

    #[tokio::test]
    async fn missing_fixture_is_an_io_error() {
        let err = FixtureSource::new(workspace_root().join("fixtures/nope.json"))
            .fetch_snapshot()
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Io { .. }));
    }
}
