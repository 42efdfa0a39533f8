//! Per-source duplicate guard and idempotent append into each exchange's
//! own detail log.

use invtrack_core::{parse_numeric_cell, round_to};
use invtrack_feeds::SourceLogSpec;
use invtrack_storage::{HeaderOutcome, StoreError, TabularStore};
use serde::Serialize;
use tracing::{debug, info};

/// Whether `new_key` is already among `existing_keys`.
///
/// An empty key is never a duplicate; it would otherwise match every blank
/// cell in the key column.
pub fn is_duplicate<S: AsRef<str>>(existing_keys: &[S], new_key: &str) -> bool {
    let key = new_key.trim();
    if key.is_empty() {
        return false;
    }
    existing_keys.iter().any(|k| k.as_ref().trim() == key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LogOutcome {
    Appended { row: usize },
    Duplicate { key: String },
}

pub async fn ensure_log_header(
    store: &dyn TabularStore,
    log: &SourceLogSpec,
) -> Result<HeaderOutcome, StoreError> {
    let _lease = store.lock_for_upsert().await?;
    write_log_header(store, log).await
}

async fn write_log_header(
    store: &dyn TabularStore,
    log: &SourceLogSpec,
) -> Result<HeaderOutcome, StoreError> {
    let header = store.write_header_row(&log.headers()).await?;
    debug!(sheet = %log.sheet, ?header, "source log header checked");
    Ok(header)
}

/// Appends `row` to the source log unless `key` is already logged.
pub async fn append_if_new(
    store: &dyn TabularStore,
    log: &SourceLogSpec,
    key: &str,
    row: &[String],
) -> Result<LogOutcome, StoreError> {
    let _lease = store.lock_for_upsert().await?;
    write_log_header(store, log).await?;

    let keys = store.column_values(SourceLogSpec::KEY_COLUMN).await?;
    let logged = keys.get(1..).unwrap_or_default();
    if is_duplicate(logged, key) {
        info!(sheet = %log.sheet, key, "already logged; skipping detail append");
        return Ok(LogOutcome::Duplicate {
            key: key.to_string(),
        });
    }

    let appended = store.append_row(row).await?;
    info!(sheet = %log.sheet, key, row = appended, "detail row appended");
    Ok(LogOutcome::Appended { row: appended })
}

/// Day-over-day change for sources that publish only a total: the delta
/// against the most recent logged total recorded under a different key.
pub async fn change_from_log(
    store: &dyn TabularStore,
    key: &str,
    total: f64,
) -> Result<Option<f64>, StoreError> {
    let keys = store.column_values(SourceLogSpec::KEY_COLUMN).await?;
    let totals = store.column_values(SourceLogSpec::TOTAL_COLUMN).await?;

    let previous = keys
        .iter()
        .zip(totals.iter())
        .skip(1)
        .rev()
        .filter(|(k, _)| k.trim() != key.trim())
        .find_map(|(_, t)| parse_numeric_cell(t));

    Ok(previous.map(|prev| round_to(total - prev, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use invtrack_storage::MemorySheet;

    fn lme_log() -> SourceLogSpec {
        SourceLogSpec {
            sheet: "LME".into(),
            key_header: "Report Date".into(),
            extras: Vec::new(),
            derive_change: false,
        }
    }

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn guard_matches_exact_keys() {
        assert!(is_duplicate(&["2026-02-20", "2026-02-21"], "2026-02-21"));
        assert!(!is_duplicate(&["2026-02-20", "2026-02-21"], "2026-02-22"));
        assert!(is_duplicate(&[" 2026-02-21 "], "2026-02-21"));
    }

    #[test]
    fn empty_key_is_never_a_duplicate() {
        let none: [&str; 0] = [];
        assert!(!is_duplicate(&none, ""));
        assert!(!is_duplicate(&["", "2026-02-21"], ""));
        assert!(!is_duplicate(&["", "  "], "   "));
    }

    #[tokio::test]
    async fn appends_once_per_key() {
        let sheet = MemorySheet::new();
        let log = lme_log();
        let row = cells(&["2026-02-25", "2026-02-24", "200000", "-1250", "src"]);

        let first = append_if_new(&sheet, &log, "2026-02-24", &row).await.unwrap();
        assert_eq!(first, LogOutcome::Appended { row: 2 });

        let second = append_if_new(&sheet, &log, "2026-02-24", &row).await.unwrap();
        assert_eq!(
            second,
            LogOutcome::Duplicate {
                key: "2026-02-24".into()
            }
        );

        let rows = sheet.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], log.headers());
    }

    #[tokio::test]
    async fn header_text_is_not_treated_as_a_logged_key() {
        let sheet = MemorySheet::new();
        let log = lme_log();
        let outcome = append_if_new(&sheet, &log, "Report Date", &cells(&["x"]))
            .await
            .unwrap();
        assert_eq!(outcome, LogOutcome::Appended { row: 2 });
    }

    #[tokio::test]
    async fn change_is_taken_against_the_previous_distinct_key() {
        let sheet = MemorySheet::from_rows([
            cells(&["Date", "Activity Date", "Total (mt)"]),
            cells(&["2026-02-21", "2026-02-20", "296,000"]),
            cells(&["2026-02-24", "2026-02-23", "n/a"]),
            cells(&["2026-02-25", "2026-02-24", "299997"]),
        ]);

        // rerun for an already-logged key ignores its own row
        let change = change_from_log(&sheet, "2026-02-24", 299_997.0).await.unwrap();
        assert_eq!(change, Some(3_997.0));

        let change = change_from_log(&sheet, "2026-02-25", 301_000.0).await.unwrap();
        assert_eq!(change, Some(1_003.0));

        let empty = MemorySheet::new();
        assert_eq!(change_from_log(&empty, "2026-02-24", 1.0).await.unwrap(), None);
    }
}
