//! Dataset loader.
//!
//! Reads every exported list file in the input directory into raw rows.
//! Exports arrive as CSV or Excel; the header row names the columns and
//! there is no schema versioning, so rows are kept as loose column→value
//! maps until the normalizer validates them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot list {path}: {message}")]
    DirUnreadable { path: PathBuf, message: String },

    #[error("failed to read {path}: {message}")]
    FileUnreadable { path: PathBuf, message: String },
}

/// One raw row from a source file: column name → cell value, plus the
/// file stem it came from (segment rules and tags key on it).
#[derive(Debug, Clone)]
pub struct RawRow {
    pub source_file: String,
    pub values: HashMap<String, String>,
}

/// Load all supported files in `input_dir` (non-recursive).
///
/// An unreadable directory is fatal; a single unreadable or malformed
/// file is skipped with a warning so the rest of the batch still syncs.
pub fn load_dir(input_dir: &Path) -> Result<Vec<RawRow>, LoadError> {
    if !input_dir.is_dir() {
        return Err(LoadError::DirUnreadable {
            path: input_dir.to_path_buf(),
            message: "not a directory".into(),
        });
    }

    let mut rows = Vec::new();
    let mut files = 0usize;

    for entry in WalkDir::new(input_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| LoadError::DirUnreadable {
            path: input_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }

        let loaded = match extension(path).as_deref() {
            Some("csv") => load_csv(path),
            Some("xlsx") | Some("xls") => load_excel(path),
            _ => continue,
        };

        match loaded {
            Ok(mut file_rows) => {
                log::info!("loaded {} rows from {}", file_rows.len(), path.display());
                files += 1;
                rows.append(&mut file_rows);
            }
            Err(e) => {
                log::warn!("skipping source file: {}", e);
            }
        }
    }

    log::info!("loaded {} rows from {} files", rows.len(), files);
    Ok(rows)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn load_csv(path: &Path) -> Result<Vec<RawRow>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| LoadError::FileUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LoadError::FileUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let source = file_stem(path);
    let mut rows = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}: bad row {}: {}", path.display(), line + 2, e);
                continue;
            }
        };
        let values = headers
            .iter()
            .zip(record.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.clone(), v.trim().to_string()))
            .collect();
        rows.push(RawRow {
            source_file: source.clone(),
            values,
        });
    }

    Ok(rows)
}

fn load_excel(path: &Path) -> Result<Vec<RawRow>, LoadError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| LoadError::FileUnreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    // Exports carry one sheet of data; match the original's behavior of
    // reading the first sheet only.
    let sheet_name = match workbook.sheet_names().first() {
        Some(name) => name.clone(),
        None => return Ok(Vec::new()),
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| LoadError::FileUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let source = file_stem(path);
    let mut rows = Vec::new();
    let mut sheet_rows = range.rows();

    let headers: Vec<String> = match sheet_rows.next() {
        Some(header) => header.iter().map(|c| cell_to_string(c).trim().to_string()).collect(),
        None => return Ok(Vec::new()),
    };

    for row in sheet_rows {
        let values = headers
            .iter()
            .zip(row.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, c)| (h.clone(), cell_to_string(c).trim().to_string()))
            .collect();
        rows.push(RawRow {
            source_file: source.clone(),
            values,
        });
    }

    Ok(rows)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            // Spreadsheets store ids and phone numbers as floats; render
            // whole numbers without the trailing ".0".
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{:?}", e),
    }
}
