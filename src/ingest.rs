use crate::models::LeadDraft;
use calamine::{open_workbook_auto, Data, Reader};
use std::collections::HashMap;
use std::path::Path;

/// One data row: column header → raw cell text.
pub type RawRow = HashMap<String, String>;

const FIRST_NAME_KEYS: [&str; 3] = ["FirstName", "firstName", "firstname"];
const PHONE_KEYS: [&str; 2] = ["Phone", "phone"];
const NOTES_KEYS: [&str; 2] = ["Notes", "notes"];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const SNIFF_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unsupported file format")]
    UnsupportedFormat,
    #[error("File content does not match its extension")]
    ContentMismatch,
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("Error parsing Excel file: {0}")]
    Spreadsheet(#[from] calamine::Error),
    #[error("Error parsing Excel file: workbook has no sheets")]
    EmptyWorkbook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Xls,
    Xlsx,
}

impl TabularFormat {
    /// Format from the client's file name. Anything but .csv/.xls/.xlsx is
    /// unsupported.
    pub fn from_file_name(name: &str) -> Result<Self, IngestError> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => Ok(TabularFormat::Csv),
            Some("xls") => Ok(TabularFormat::Xls),
            Some("xlsx") => Ok(TabularFormat::Xlsx),
            _ => Err(IngestError::UnsupportedFormat),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TabularFormat::Csv => ".csv",
            TabularFormat::Xls => ".xls",
            TabularFormat::Xlsx => ".xlsx",
        }
    }

    /// Check the leading bytes agree with the format picked from the name.
    pub fn sniff(self, content: &[u8]) -> Result<(), IngestError> {
        let ok = match self {
            TabularFormat::Xlsx => content.starts_with(ZIP_MAGIC),
            TabularFormat::Xls => content.starts_with(OLE_MAGIC),
            TabularFormat::Csv => {
                let head = &content[..content.len().min(SNIFF_LEN)];
                !content.starts_with(ZIP_MAGIC)
                    && !content.starts_with(OLE_MAGIC)
                    && !head.contains(&0)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(IngestError::ContentMismatch)
        }
    }
}

/// Parse a staged upload into raw rows. Blocking; call from `spawn_blocking`.
pub fn parse_file(path: &Path, format: TabularFormat) -> Result<Vec<RawRow>, IngestError> {
    match format {
        TabularFormat::Csv => parse_csv(path),
        TabularFormat::Xls | TabularFormat::Xlsx => parse_spreadsheet(path),
    }
}

fn parse_csv(path: &Path) -> Result<Vec<RawRow>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            if i == 0 {
                h.trim_start_matches('\u{feff}').to_string()
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn parse_spreadsheet(path: &Path) -> Result<Vec<RawRow>, IngestError> {
    let mut workbook = open_workbook_auto(path)?;
    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(IngestError::EmptyWorkbook)?;
    let range = workbook.worksheet_range(&first_sheet)?;

    let mut rows_iter = range.rows();
    let headers: Vec<Option<String>> = match rows_iter.next() {
        Some(cells) => cells
            .iter()
            .map(|c| cell_text(c).filter(|h| !h.is_empty()))
            .collect(),
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for cells in rows_iter {
        let row: RawRow = headers
            .iter()
            .zip(cells.iter())
            .filter_map(|(h, c)| Some((h.clone()?, cell_text(c)?)))
            .collect();
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Cell as text; `None` for empty and error cells.
fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(s.clone()),
        Data::Int(i) => Some(i.to_string()),
        // f64 Display drops a trailing ".0", so phone numbers stored as
        // numbers come back as digits.
        Data::Float(f) => Some(f.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(dt) => Some(dt.as_f64().to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
    }
}

fn pick(row: &RawRow, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Map a raw row onto a lead. `None` when first name or phone is blank.
pub fn normalize_row(row: &RawRow) -> Option<LeadDraft> {
    let first_name = pick(row, &FIRST_NAME_KEYS);
    let phone = pick(row, &PHONE_KEYS);
    if first_name.is_empty() || phone.is_empty() {
        return None;
    }
    Some(LeadDraft {
        first_name,
        phone,
        notes: pick(row, &NOTES_KEYS),
    })
}

/// Valid rows in input order; invalid ones are dropped without a report.
pub fn normalize_rows(rows: &[RawRow]) -> Vec<LeadDraft> {
    rows.iter().filter_map(normalize_row).collect()
}
