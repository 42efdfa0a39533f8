//! One feed run: snapshot → source log → dashboard row.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use invtrack_feeds::{FeedSnapshot, FixtureSource, SnapshotSource};
use invtrack_storage::{FileSheet, HeaderOutcome, LockPolicy, TabularStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dedup::{append_if_new, change_from_log, ensure_log_header, LogOutcome};
use crate::engine::{SummaryEngine, UpsertOutcome};
use crate::layout::DashboardLayout;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_dir: PathBuf,
    /// Layout YAML; the built-in copper dashboard when unset.
    pub layout_path: Option<PathBuf>,
    pub lock_timeout_secs: u64,
    pub lock_stale_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var("INVTRACK_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            layout_path: std::env::var("INVTRACK_LAYOUT").ok().map(PathBuf::from),
            lock_timeout_secs: std::env::var("INVTRACK_LOCK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            lock_stale_secs: std::env::var("INVTRACK_LOCK_STALE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_secs(self.lock_timeout_secs),
            stale_after: Duration::from_secs(self.lock_stale_secs),
            ..LockPolicy::default()
        }
    }

    pub fn load_layout(&self) -> Result<DashboardLayout> {
        match &self.layout_path {
            Some(path) => DashboardLayout::from_yaml_path(path)
                .with_context(|| format!("loading layout {}", path.display())),
            None => Ok(DashboardLayout::copper()),
        }
    }

    /// File backing the sheet named `name`.
    pub fn sheet_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.json"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub data_date: NaiveDate,
    /// `None` when the source keeps no detail log.
    pub log: Option<LogOutcome>,
    pub upsert: UpsertOutcome,
}

/// Stores a feed run writes to: the dashboard plus one log per source sheet.
pub struct FeedRunner {
    engine: SummaryEngine,
    summary: Arc<dyn TabularStore>,
    logs: BTreeMap<String, Arc<dyn TabularStore>>,
}

impl FeedRunner {
    pub fn new(engine: SummaryEngine, summary: Arc<dyn TabularStore>) -> Self {
        Self {
            engine,
            summary,
            logs: BTreeMap::new(),
        }
    }

    /// Attaches the store backing the log sheet named `sheet`.
    pub fn with_log_sheet(mut self, sheet: impl Into<String>, store: Arc<dyn TabularStore>) -> Self {
        self.logs.insert(sheet.into(), store);
        self
    }

    /// File-backed sheets under the configured state directory.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let layout = config.load_layout()?;
        let policy = config.lock_policy();
        let summary = FileSheet::new(config.sheet_path(layout.sheet())).with_lock_policy(policy);

        let log_sheets: Vec<String> = layout
            .sources()
            .iter()
            .filter_map(|s| s.log.as_ref().map(|l| l.sheet.clone()))
            .collect();
        let mut runner = Self::new(SummaryEngine::new(layout), Arc::new(summary));
        for sheet in log_sheets {
            let store = FileSheet::new(config.sheet_path(&sheet)).with_lock_policy(policy);
            runner = runner.with_log_sheet(sheet, Arc::new(store));
        }
        Ok(runner)
    }

    pub fn engine(&self) -> &SummaryEngine {
        &self.engine
    }

    pub fn summary_store(&self) -> &dyn TabularStore {
        self.summary.as_ref()
    }

    /// Writes the header row of the dashboard and of every attached log.
    pub async fn init_sheets(&self) -> Result<Vec<(String, HeaderOutcome)>> {
        let mut outcomes = Vec::new();
        let outcome = self
            .engine
            .ensure_headers(self.summary.as_ref())
            .await
            .context("writing summary header")?;
        outcomes.push((self.engine.layout().sheet().to_string(), outcome));

        for source in self.engine.layout().sources() {
            let Some(log) = &source.log else { continue };
            let Some(store) = self.logs.get(&log.sheet) else {
                warn!(sheet = %log.sheet, "no store attached for source log");
                continue;
            };
            let outcome = ensure_log_header(store.as_ref(), log)
                .await
                .with_context(|| format!("writing {} log header", log.sheet))?;
            outcomes.push((log.sheet.clone(), outcome));
        }
        Ok(outcomes)
    }

    pub async fn run(&self, snapshot: &FeedSnapshot, run_date: NaiveDate) -> Result<FeedRunSummary> {
        let run_id = Uuid::new_v4();
        let mut record = snapshot
            .to_record()
            .with_context(|| format!("normalizing {} snapshot", snapshot.source_id))?;
        let slots = self.engine.slots_for(&record.source_id)?;
        info!(%run_id, source = %record.source_id, date = %record.date_key(), "feed run started");

        let log = match &slots.log {
            Some(log_spec) => {
                let Some(store) = self.logs.get(&log_spec.sheet) else {
                    bail!(
                        "source {} logs to sheet {} but no store is attached",
                        record.source_id,
                        log_spec.sheet
                    );
                };
                let key = log_spec.key_for(&record);

                if log_spec.derive_change && record.change.is_none() {
                    if let Some(total) = record.total_value() {
                        match change_from_log(store.as_ref(), &key, total)
                            .await
                            .with_context(|| format!("reading {} log", log_spec.sheet))?
                        {
                            Some(change) => record = record.with_change(change),
                            None => info!(sheet = %log_spec.sheet, "no earlier logged total; change left blank"),
                        }
                    }
                }

                let row = log_spec
                    .row(run_date, &record, snapshot)
                    .with_context(|| format!("building {} log row", log_spec.sheet))?;
                let outcome = append_if_new(store.as_ref(), log_spec, &key, &row)
                    .await
                    .with_context(|| format!("appending to {} log", log_spec.sheet))?;
                Some(outcome)
            }
            None => None,
        };

        // a duplicate log entry still refreshes the dashboard row
        let upsert = self
            .engine
            .upsert(self.summary.as_ref(), &record)
            .await
            .with_context(|| format!("upserting {} for {}", record.source_id, record.date_key()))?;

        Ok(FeedRunSummary {
            run_id,
            source_id: record.source_id.clone(),
            data_date: record.data_date,
            log,
            upsert,
        })
    }

    pub async fn run_source(&self, source: &dyn SnapshotSource) -> Result<FeedRunSummary> {
        let snapshot = source
            .fetch_snapshot()
            .await
            .with_context(|| format!("fetching {}", source.describe()))?;
        self.run(&snapshot, snapshot.fetched_on()).await
    }
}

pub async fn run_feed_from_env(snapshot_path: &Path) -> Result<FeedRunSummary> {
    let config = SyncConfig::from_env();
    let runner = FeedRunner::from_config(&config)?;
    runner.run_source(&FixtureSource::new(snapshot_path)).await
}
