use invtrack_core::{format_fixed, format_number, parse_numeric_cell};

/// One summary row as cell text, padded to the layout width.
///
/// Cells beyond the layout width (legacy columns) are carried through
/// untouched so a full-row write never truncates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    cells: Vec<String>,
}

impl SummaryRow {
    pub fn blank(width: usize, date_column: usize, date_key: &str) -> Self {
        let mut row = Self::from_cells(Vec::new(), width.max(date_column + 1));
        row.set(date_column, date_key);
        row
    }

    /// Short rows are padded with empty cells rather than rejected.
    pub fn from_cells(mut cells: Vec<String>, width: usize) -> Self {
        if cells.len() < width {
            cells.resize(width, String::new());
        }
        Self { cells }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<String> {
        self.cells
    }

    pub fn cell(&self, column: usize) -> &str {
        self.cells.get(column).map(String::as_str).unwrap_or_default()
    }

    pub fn number(&self, column: usize) -> Option<f64> {
        parse_numeric_cell(self.cell(column))
    }

    pub fn set(&mut self, column: usize, value: impl Into<String>) {
        if self.cells.len() <= column {
            self.cells.resize(column + 1, String::new());
        }
        self.cells[column] = value.into();
    }

    /// Writes a quantity, or clears the cell when absent.
    pub fn set_number(&mut self, column: usize, value: Option<f64>) {
        self.set(column, value.map(format_number).unwrap_or_default());
    }

    pub fn set_fixed(&mut self, column: usize, value: Option<f64>, decimals: usize) {
        self.set(
            column,
            value.map(|v| format_fixed(v, decimals)).unwrap_or_default(),
        );
    }
}
