use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use invtrack_core::{format_date, round_to};
use invtrack_storage::{StoreError, TabularStore};

use crate::layout::DashboardLayout;
use crate::row::SummaryRow;

/// Date key → 1-based row index, built from one read of the date column.
#[derive(Debug, Clone, Default)]
pub struct DateIndex {
    rows: HashMap<String, usize>,
    duplicates: Vec<(String, usize)>,
}

impl DateIndex {
    pub fn from_column(values: &[String]) -> Self {
        let mut index = Self::default();
        for (i, value) in values.iter().enumerate() {
            let key = value.trim();
            if key.is_empty() {
                continue;
            }
            // first occurrence wins
            if index.rows.contains_key(key) {
                index.duplicates.push((key.to_string(), i + 1));
            } else {
                index.rows.insert(key.to_string(), i + 1);
            }
        }
        index
    }

    pub fn row_for(&self, key: &str) -> Option<usize> {
        self.rows.get(key).copied()
    }

    /// Later rows repeating an already-indexed date.
    pub fn duplicates(&self) -> &[(String, usize)] {
        &self.duplicates
    }
}

pub fn prior_week(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(7))
}

pub fn week_over_week_delta(current: Option<f64>, prior: Option<f64>) -> Option<f64> {
    match (current, prior) {
        (Some(current), Some(prior)) => Some(round_to(current - prior, 0)),
        _ => None,
    }
}

/// Delta of `combined_total` against the row dated exactly seven days
/// earlier. No row for that date, or no combined total in it, means no delta.
pub async fn resolve_week_over_week(
    store: &dyn TabularStore,
    layout: &DashboardLayout,
    index: &DateIndex,
    date: NaiveDate,
    combined_total: Option<f64>,
) -> Result<Option<f64>, StoreError> {
    if combined_total.is_none() {
        return Ok(None);
    }
    let Some(target) = prior_week(date) else {
        return Ok(None);
    };
    let Some(row_index) = index.row_for(&format_date(target)) else {
        return Ok(None);
    };
    let prior = SummaryRow::from_cells(store.row_values(row_index).await?, layout.width());
    Ok(week_over_week_delta(
        combined_total,
        prior.number(layout.combined_total()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use invtrack_storage::MemorySheet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn copper_row(date_key: &str, combined: &str) -> Vec<String> {
        let layout = DashboardLayout::copper();
        let mut row = SummaryRow::blank(layout.width(), 0, date_key);
        row.set(layout.combined_total(), combined);
        row.into_cells()
    }

    #[test]
    fn index_keeps_the_first_row_per_date() {
        let column: Vec<String> = ["Data Date", "2026-02-24", "", "2026-02-25", "2026-02-24"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let index = DateIndex::from_column(&column);
        assert_eq!(index.row_for("2026-02-24"), Some(2));
        assert_eq!(index.row_for("2026-02-25"), Some(4));
        assert_eq!(index.row_for("2026-02-26"), None);
        assert_eq!(index.duplicates(), &[("2026-02-24".to_string(), 5)]);
    }

    #[test]
    fn delta_needs_both_sides() {
        assert_eq!(week_over_week_delta(Some(310_000.0), Some(500_000.0)), Some(-190_000.0));
        assert_eq!(week_over_week_delta(None, Some(500_000.0)), None);
        assert_eq!(week_over_week_delta(Some(310_000.0), None), None);
        assert_eq!(prior_week(date(2026, 3, 3)), Some(date(2026, 2, 24)));
    }

    #[tokio::test]
    async fn resolves_against_the_same_weekday_only() {
        let layout = DashboardLayout::copper();
        let sheet = MemorySheet::from_rows([
            layout.headers().to_vec(),
            copper_row("2026-02-23", "480000"),
            copper_row("2026-02-24", "500000"),
            copper_row("2026-02-25", ""),
        ]);
        let index = DateIndex::from_column(&sheet.column_values(1).await.unwrap());

        let wow = resolve_week_over_week(&sheet, &layout, &index, date(2026, 3, 3), Some(310_000.0))
            .await
            .unwrap();
        assert_eq!(wow, Some(-190_000.0));

        // prior row exists but carries no combined total
        let wow = resolve_week_over_week(&sheet, &layout, &index, date(2026, 3, 4), Some(310_000.0))
            .await
            .unwrap();
        assert_eq!(wow, None);

        // no row exactly seven days earlier; nearby dates are not used
        let wow = resolve_week_over_week(&sheet, &layout, &index, date(2026, 3, 5), Some(310_000.0))
            .await
            .unwrap();
        assert_eq!(wow, None);

        let wow = resolve_week_over_week(&sheet, &layout, &index, date(2026, 3, 3), None)
            .await
            .unwrap();
        assert_eq!(wow, None);
    }
}
