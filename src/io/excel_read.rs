use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use calamine::{DataType, Reader, Xlsx, open_workbook};
use tracing::debug;

use crate::config::ColumnRef;
use crate::error::{Result, ToolError};
use crate::model::{RawCell, RawRow, SheetTable};

/// Workbook handle used by both execution modes.
pub type Workbook = Xlsx<BufReader<File>>;

/// Opens the workbook at `path`.
pub fn open(path: &Path) -> Result<Workbook> {
    if !path.exists() {
        return Err(ToolError::MissingInput(path.to_path_buf()));
    }
    let workbook: Workbook = open_workbook(path)?;
    Ok(workbook)
}

/// Lists the sheet names of the workbook at `path`.
pub fn sheet_names(path: &Path) -> Result<Vec<String>> {
    Ok(open(path)?.sheet_names())
}

/// Maps a configured sheet name onto the workbook; an empty name selects the
/// first sheet.
pub fn resolve_sheet_name(available: &[String], wanted: &str) -> Option<String> {
    if wanted.trim().is_empty() {
        return available.first().cloned();
    }
    available.iter().find(|name| name.as_str() == wanted).cloned()
}

/// Streams a sheet cell by cell, keeping the header row and only the
/// columns listed in `keep`.
pub fn stream_sheet<R: Read + Seek>(
    workbook: &mut Xlsx<R>,
    sheet: &str,
    keep: &[ColumnRef],
) -> Result<SheetTable> {
    let mut collector = SheetCollector::new(sheet, Some(keep));
    let mut cells = workbook.worksheet_cells_reader(sheet)?;
    while let Some(cell) = cells.next_cell()? {
        let (row, column) = cell.get_position();
        collector.push(row, column as usize, raw_cell(cell.get_value()));
    }
    let table = collector.finish();
    debug!(sheet, rows = table.rows.len(), columns = keep.len(), "streamed sheet");
    Ok(table)
}

/// Loads every column of a sheet at once.
pub fn load_sheet<R: Read + Seek>(workbook: &mut Xlsx<R>, sheet: &str) -> Result<SheetTable> {
    let range = workbook.worksheet_range(sheet)?;
    let mut collector = SheetCollector::new(sheet, None);
    if let Some((first_row, first_column)) = range.start() {
        for (row, column, cell) in range.cells() {
            collector.push(
                first_row + row as u32,
                first_column as usize + column,
                raw_cell(cell),
            );
        }
    }
    let table = collector.finish();
    debug!(sheet, rows = table.rows.len(), "loaded sheet");
    Ok(table)
}

fn raw_cell<T: DataType>(cell: &T) -> RawCell {
    if cell.is_empty() {
        return RawCell::Empty;
    }
    if let Some(text) = cell.get_string() {
        return RawCell::Text(text.to_string());
    }
    if let Some(value) = cell.get_int() {
        return RawCell::Int(value);
    }
    if let Some(value) = cell.get_float() {
        return RawCell::Float(value);
    }
    if let Some(value) = cell.get_bool() {
        return RawCell::Bool(value);
    }
    if let Some(datetime) = cell.get_datetime() {
        return if datetime.is_datetime() {
            RawCell::DateTime(datetime)
        } else {
            RawCell::Float(datetime.as_f64())
        };
    }
    if let Some(text) = cell.get_datetime_iso().or_else(|| cell.get_duration_iso()) {
        return RawCell::Text(text.to_string());
    }
    RawCell::Error("#ERROR".to_string())
}

/// Accumulates cells delivered in row-major order into a [`SheetTable`].
///
/// The first row holding a non-empty cell is the header row. Once it is
/// known, cells outside the kept columns are dropped as they arrive.
struct SheetCollector<'a> {
    table: SheetTable,
    keep: Option<&'a [ColumnRef]>,
    keep_indices: Option<BTreeSet<usize>>,
    header_found: bool,
    current_row: Option<u32>,
    pending: BTreeMap<usize, RawCell>,
}

impl<'a> SheetCollector<'a> {
    fn new(sheet: &str, keep: Option<&'a [ColumnRef]>) -> Self {
        SheetCollector {
            table: SheetTable {
                name: sheet.to_string(),
                ..SheetTable::default()
            },
            keep,
            keep_indices: None,
            header_found: false,
            current_row: None,
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, row: u32, column: usize, cell: RawCell) {
        if self.current_row != Some(row) {
            self.flush();
            self.current_row = Some(row);
        }
        if cell.is_empty() {
            return;
        }
        let wanted = match (&self.keep_indices, self.header_found) {
            (Some(indices), true) => indices.contains(&column),
            _ => true,
        };
        if wanted {
            self.pending.insert(column, cell);
        }
    }

    fn flush(&mut self) {
        let Some(row) = self.current_row.take() else {
            return;
        };
        let cells = std::mem::take(&mut self.pending);
        if cells.values().all(RawCell::is_empty) {
            return;
        }
        if !self.header_found {
            self.table.headers = cells
                .into_iter()
                .map(|(column, cell)| (column, cell.to_text().trim().to_string()))
                .filter(|(_, header)| !header.is_empty())
                .collect();
            self.keep_indices = self.keep.map(|columns| {
                columns
                    .iter()
                    .filter_map(|column| self.table.resolve(column))
                    .collect()
            });
            self.header_found = true;
            return;
        }
        self.table.rows.push(RawRow {
            number: row + 1,
            cells,
        });
    }

    fn finish(mut self) -> SheetTable {
        self.flush();
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(collector: &mut SheetCollector<'_>, rows: Vec<(u32, Vec<(usize, RawCell)>)>) {
        for (row, cells) in rows {
            for (column, cell) in cells {
                collector.push(row, column, cell);
            }
        }
    }

    #[test]
    fn collector_finds_header_and_skips_blank_rows() {
        let mut collector = SheetCollector::new("Items", None);
        feed(
            &mut collector,
            vec![
                (0, vec![(0, RawCell::Empty)]),
                (1, vec![(1, RawCell::Text("id".into())), (2, RawCell::Text("name".into()))]),
                (2, vec![(1, RawCell::Float(1.0)), (2, RawCell::Text("Sword".into()))]),
                (3, vec![(1, RawCell::Text("  ".into()))]),
                (4, vec![(1, RawCell::Float(2.0))]),
            ],
        );
        let table = collector.finish();
        assert_eq!(table.headers.get(&1).map(String::as_str), Some("id"));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].number, 3);
        assert_eq!(table.rows[1].number, 5);
        assert_eq!(table.rows[1].cell(2), &RawCell::Empty);
    }

    #[test]
    fn collector_keeps_only_requested_columns() {
        let keep = [ColumnRef::Name("id".into()), ColumnRef::Index(3)];
        let mut collector = SheetCollector::new("Items", Some(&keep));
        feed(
            &mut collector,
            vec![
                (0, vec![(0, RawCell::Text("id".into())), (1, RawCell::Text("name".into()))]),
                (
                    1,
                    vec![
                        (0, RawCell::Int(1)),
                        (1, RawCell::Text("Sword".into())),
                        (3, RawCell::Text("x".into())),
                    ],
                ),
            ],
        );
        let table = collector.finish();
        assert_eq!(table.headers.len(), 2);
        let cells: Vec<usize> = table.rows[0].cells.keys().copied().collect();
        assert_eq!(cells, vec![0, 3]);
    }

    #[test]
    fn empty_sheet_yields_no_rows() {
        let table = SheetCollector::new("Empty", None).finish();
        assert!(table.headers.is_empty());
        assert!(table.rows.is_empty());
    }

    #[test]
    fn empty_sheet_name_selects_first_sheet() {
        let names = vec!["First".to_string(), "Second".to_string()];
        assert_eq!(resolve_sheet_name(&names, ""), Some("First".to_string()));
        assert_eq!(resolve_sheet_name(&names, "Second"), Some("Second".to_string()));
        assert_eq!(resolve_sheet_name(&names, "Third"), None);
    }
}
