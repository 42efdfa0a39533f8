//! Summary upsert engine.
//!
//! One row per data date. A record only ever writes the slots its source
//! owns; everything else in the row is carried over from the pre-image, then
//! the derived columns are recomputed and the full row is written back.

use std::collections::HashMap;

use chrono::NaiveDate;
use invtrack_core::{format_date, parse_date_cell, SourceRecord};
use invtrack_storage::{row_fingerprint, HeaderOutcome, StoreError, TabularStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::derive::derive;
use crate::layout::{DashboardLayout, SourceSlots};
use crate::row::SummaryRow;
use crate::weekly::{prior_week, resolve_week_over_week, week_over_week_delta, DateIndex};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("unknown source {source_id:?} (known: {known})")]
    UnknownSource { source_id: String, known: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("row {row} for {date} changed while it was being merged")]
    ConcurrentModification { date: String, row: usize },
    #[error("a row for {date} appeared at row {row} while it was being merged")]
    ConcurrentInsert { date: String, row: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
    /// Row rewritten with identical contents.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertOutcome {
    pub row: usize,
    pub action: UpsertAction,
    pub cells: Vec<String>,
    /// Extras in the record that map to no slot of its source.
    pub ignored_extras: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeSummary {
    pub rows_scanned: usize,
    pub rows_rewritten: usize,
}

#[derive(Debug, Clone)]
pub struct SummaryEngine {
    layout: DashboardLayout,
}

impl SummaryEngine {
    pub fn new(layout: DashboardLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DashboardLayout {
        &self.layout
    }

    pub fn slots_for(&self, source_id: &str) -> Result<&SourceSlots, UpsertError> {
        self.layout
            .source(source_id)
            .ok_or_else(|| UpsertError::UnknownSource {
                source_id: source_id.to_string(),
                known: self.layout.source_ids().join(", "),
            })
    }

    /// Writes the summary header under the upsert lease, so it never races a
    /// concurrent row write.
    pub async fn ensure_headers(&self, store: &dyn TabularStore) -> Result<HeaderOutcome, StoreError> {
        let _lease = store.lock_for_upsert().await?;
        self.write_header_locked(store).await
    }

    async fn write_header_locked(&self, store: &dyn TabularStore) -> Result<HeaderOutcome, StoreError> {
        let outcome = store.write_header_row(self.layout.headers()).await?;
        if outcome != HeaderOutcome::Unchanged {
            info!(sheet = %self.layout.sheet(), ?outcome, "summary header written");
        }
        Ok(outcome)
    }

    /// Merges `record` into the single row for its data date.
    pub async fn upsert(
        &self,
        store: &dyn TabularStore,
        record: &SourceRecord,
    ) -> Result<UpsertOutcome, UpsertError> {
        // reject before touching the store
        let slots = self.slots_for(&record.source_id)?;
        let date_key = record.date_key();
        let span = info_span!("summary_upsert", source = %record.source_id, date = %date_key);
        self.upsert_with_slots(store, slots, record, date_key)
            .instrument(span)
            .await
    }

    async fn upsert_with_slots(
        &self,
        store: &dyn TabularStore,
        slots: &SourceSlots,
        record: &SourceRecord,
        date_key: String,
    ) -> Result<UpsertOutcome, UpsertError> {
        let lease = store.lock_for_upsert().await?;
        if !lease.is_exclusive() {
            debug!("store has no upsert lock; relying on external serialization");
        }
        self.write_header_locked(store).await?;

        let date_column = self.layout.date_column() + 1;
        let index = DateIndex::from_column(&store.column_values(date_column).await?);
        if index.duplicates().iter().any(|(k, _)| *k == date_key) {
            warn!(duplicates = ?index.duplicates(), "date appears on more than one row; merging into the first");
        }

        let existing = index.row_for(&date_key);
        let (pre_image, mut row) = match existing {
            Some(row_index) => {
                let cells = store.row_values(row_index).await?;
                let row = SummaryRow::from_cells(cells.clone(), self.layout.width());
                (cells, row)
            }
            None => (
                Vec::new(),
                SummaryRow::blank(self.layout.width(), self.layout.date_column(), &date_key),
            ),
        };
        let before = row.clone();

        let ignored_extras = merge_record(slots, record, &mut row);
        if !ignored_extras.is_empty() {
            warn!(?ignored_extras, "record carries extras its source does not own");
        }

        let mut row = derive(&self.layout, &row);
        let wow = resolve_week_over_week(
            store,
            &self.layout,
            &index,
            record.data_date,
            row.number(self.layout.combined_total()),
        )
        .await?;
        row.set_number(self.layout.week_over_week(), wow);

        let (row_index, action) = match existing {
            Some(row_index) => {
                let current = store.row_values(row_index).await?;
                if row_fingerprint(&current) != row_fingerprint(&pre_image) {
                    return Err(UpsertError::ConcurrentModification {
                        date: date_key,
                        row: row_index,
                    });
                }
                store.write_row(row_index, row.cells()).await?;
                let action = if row == before {
                    UpsertAction::Unchanged
                } else {
                    UpsertAction::Updated
                };
                (row_index, action)
            }
            None => {
                let recheck = DateIndex::from_column(&store.column_values(date_column).await?);
                if let Some(row_index) = recheck.row_for(&date_key) {
                    return Err(UpsertError::ConcurrentInsert {
                        date: date_key,
                        row: row_index,
                    });
                }
                (store.append_row(row.cells()).await?, UpsertAction::Created)
            }
        };
        drop(lease);

        info!(
            row = row_index,
            ?action,
            total = ?record.total_value(),
            "summary row written"
        );
        Ok(UpsertOutcome {
            row: row_index,
            action,
            cells: row.into_cells(),
            ignored_extras,
        })
    }

    pub async fn find_row(
        &self,
        store: &dyn TabularStore,
        date: NaiveDate,
    ) -> Result<Option<(usize, SummaryRow)>, StoreError> {
        let index = DateIndex::from_column(&store.column_values(self.layout.date_column() + 1).await?);
        let Some(row_index) = index.row_for(&format_date(date)) else {
            return Ok(None);
        };
        let cells = store.row_values(row_index).await?;
        Ok(Some((row_index, SummaryRow::from_cells(cells, self.layout.width()))))
    }

    /// Re-derives every dated row, oldest first, so week-over-week values see
    /// already-recomputed prior weeks. Only rows whose cells change are written.
    pub async fn recompute_all(&self, store: &dyn TabularStore) -> Result<RecomputeSummary, UpsertError> {
        let _lease = store.lock_for_upsert().await?;
        let dates = store.column_values(self.layout.date_column() + 1).await?;

        let mut dated: Vec<(NaiveDate, usize)> = dates
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| parse_date_cell(cell).map(|d| (d, i + 1)))
            .collect();
        dated.sort();

        let mut combined_by_date: HashMap<NaiveDate, Option<f64>> = HashMap::new();
        let mut summary = RecomputeSummary::default();
        for (date, row_index) in dated {
            summary.rows_scanned += 1;
            let before = SummaryRow::from_cells(store.row_values(row_index).await?, self.layout.width());
            let mut row = derive(&self.layout, &before);

            let combined = row.number(self.layout.combined_total());
            let prior = prior_week(date)
                .and_then(|d| combined_by_date.get(&d).copied())
                .flatten();
            row.set_number(self.layout.week_over_week(), week_over_week_delta(combined, prior));
            combined_by_date.entry(date).or_insert(combined);

            if row != before {
                store.write_row(row_index, row.cells()).await?;
                summary.rows_rewritten += 1;
                debug!(row = row_index, %date, "summary row recomputed");
            }
        }

        info!(
            scanned = summary.rows_scanned,
            rewritten = summary.rows_rewritten,
            "summary recompute finished"
        );
        Ok(summary)
    }
}

/// Writes the record's reported values into the source's own slots and
/// returns the names of extras that have no slot.
fn merge_record(slots: &SourceSlots, record: &SourceRecord, row: &mut SummaryRow) -> Vec<String> {
    if let Some(total) = record.total {
        row.set(slots.total, total.to_cell());
    }
    if let Some(change) = record.change {
        row.set(slots.change, change.to_cell());
    }

    let mut ignored = Vec::new();
    for (name, reading) in &record.extras {
        match slots.extras.get(name) {
            Some(column) => row.set(*column, reading.to_cell()),
            None => ignored.push(name.clone()),
        }
    }
    ignored
}
