//! Derived summary fields: per-source ratios and cross-source aggregates.
//!
//! Everything here is a pure function of a row's raw cells. A derived cell
//! whose inputs are missing is cleared, never left stale and never zeroed.

use invtrack_core::round_to;

use crate::layout::{DashboardLayout, RatioSlot};
use crate::row::SummaryRow;

/// Recomputes every ratio and aggregate column. Week-over-week needs other
/// rows and is resolved separately.
pub fn derive(layout: &DashboardLayout, row: &SummaryRow) -> SummaryRow {
    let mut out = row.clone();
    for ratio in layout.ratios() {
        out.set_fixed(ratio.output, ratio_value(ratio, row), 1);
    }
    out.set_number(layout.combined_total(), combined_total(layout, row));
    out.set_number(layout.combined_change(), combined_change(layout, row));
    out
}

pub fn ratio_value(ratio: &RatioSlot, row: &SummaryRow) -> Option<f64> {
    match (row.number(ratio.numerator), row.number(ratio.denominator)) {
        (Some(part), Some(total)) if total != 0.0 => Some(round_to(part / total * 100.0, 1)),
        _ => None,
    }
}

/// Sum of whichever source totals are present.
pub fn combined_total(layout: &DashboardLayout, row: &SummaryRow) -> Option<f64> {
    let totals: Vec<f64> = layout
        .sources()
        .iter()
        .filter_map(|s| row.number(s.total))
        .collect();
    if totals.is_empty() {
        return None;
    }
    Some(round_to(totals.iter().sum(), 0))
}

/// Sum of every source's change, only once all of them have reported.
pub fn combined_change(layout: &DashboardLayout, row: &SummaryRow) -> Option<f64> {
    let changes: Option<Vec<f64>> = layout
        .sources()
        .iter()
        .map(|s| row.number(s.change))
        .collect();
    changes.map(|c| round_to(c.iter().sum(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    // copper layout columns
    const COMEX_T: usize = 1;
    const COMEX_C: usize = 2;
    const COMEX_REG: usize = 3;
    const COMEX_PCT: usize = 5;
    const LME_T: usize = 6;
    const LME_C: usize = 7;
    const LME_CW: usize = 8;
    const LME_CW_PCT: usize = 9;
    const SHFE_T: usize = 10;
    const SHFE_C: usize = 11;
    const COMB_T: usize = 12;
    const COMB_C: usize = 13;

    fn row_with(cells: &[(usize, &str)]) -> SummaryRow {
        let layout = DashboardLayout::copper();
        let mut row = SummaryRow::blank(layout.width(), 0, "2026-02-24");
        for (column, value) in cells {
            row.set(*column, *value);
        }
        row
    }

    #[test]
    fn ratio_is_a_rounded_percentage() {
        let layout = DashboardLayout::copper();
        let row = derive(&layout, &row_with(&[(COMEX_T, "300000"), (COMEX_REG, "75000")]));
        assert_eq!(row.cell(COMEX_PCT), "25.0");

        let row = derive(&layout, &row_with(&[(COMEX_T, "300000"), (COMEX_REG, "100000")]));
        assert_eq!(row.cell(COMEX_PCT), "33.3");
    }

    #[test]
    fn ratio_clears_on_zero_or_missing_total() {
        let layout = DashboardLayout::copper();
        let stale = row_with(&[(COMEX_T, "0"), (COMEX_REG, "75000"), (COMEX_PCT, "12.0")]);
        assert_eq!(derive(&layout, &stale).cell(COMEX_PCT), "");

        let stale = row_with(&[(COMEX_REG, "75000"), (COMEX_PCT, "12.0")]);
        assert_eq!(derive(&layout, &stale).cell(COMEX_PCT), "");
    }

    #[test]
    fn manual_cancelled_warrants_feed_the_lme_ratio() {
        let layout = DashboardLayout::copper();
        let row = derive(&layout, &row_with(&[(LME_T, "200000"), (LME_CW, "50,000")]));
        assert_eq!(row.cell(LME_CW_PCT), "25.0");
        assert_eq!(row.cell(LME_CW), "50,000");
    }

    #[test]
    fn combined_total_sums_whatever_has_reported() {
        let layout = DashboardLayout::copper();
        let only_lme = derive(&layout, &row_with(&[(LME_T, "200000")]));
        assert_eq!(only_lme.cell(COMB_T), "200000");

        let two = derive(&layout, &row_with(&[(COMEX_T, "300000"), (LME_T, "200000")]));
        assert_eq!(two.cell(COMB_T), "500000");

        let none = derive(&layout, &row_with(&[(COMB_T, "999")]));
        assert_eq!(none.cell(COMB_T), "");
    }

    #[test]
    fn combined_change_is_all_or_nothing() {
        let layout = DashboardLayout::copper();
        let partial = row_with(&[
            (COMEX_T, "300000"),
            (LME_T, "200000"),
            (SHFE_T, "150000"),
            (COMEX_C, "1000"),
            (LME_C, "-1250"),
        ]);
        assert_eq!(derive(&layout, &partial).cell(COMB_C), "");

        let mut complete = partial.clone();
        complete.set(SHFE_C, "3500");
        assert_eq!(derive(&layout, &complete).cell(COMB_C), "3250");
    }

    #[test]
    fn deriving_twice_changes_nothing() {
        let layout = DashboardLayout::copper();
        let row = row_with(&[(COMEX_T, "299997"), (COMEX_REG, "74999"), (LME_T, "200000")]);
        let once = derive(&layout, &row);
        assert_eq!(derive(&layout, &once), once);
    }
}
