//! Core library for the excel-to-xml synchronisation tool.
//!
//! A JSON configuration maps workbook columns onto locations in a directory
//! of XML files. Each run correlates rows with nodes through a key, then
//! updates, inserts or deletes nodes so the XML reflects the workbook while
//! everything the configuration does not mention is left byte for byte as it
//! was. Configuration handling lives in [`config`], workbook reading under
//! [`io::excel_read`] and [`extract`], the editable XML tree in
//! [`io::xml_doc`], row/node correlation in [`mapper`], orchestration in
//! [`sync`] and outcome reporting in [`report`]. [`ffi`] exposes the same
//! entry points over a C ABI.

pub mod config;
pub mod error;
pub mod extract;
pub mod ffi;
pub mod io;
pub mod mapper;
pub mod model;
pub mod report;
pub mod sync;

use std::path::Path;

pub use config::Config;
pub use error::{Result, ToolError};
pub use report::RunReport;
pub use sync::{CancelToken, Mode, RunOptions};

/// Status codes returned across the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    InvalidConfigText = -1,
    InvalidExcelPath = -2,
    InvalidXmlDirPath = -3,
    Failed = -4,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps the outcome of a run onto a status code.
    pub fn from_outcome(outcome: &Result<RunReport>) -> StatusCode {
        match outcome {
            Ok(report) if report.is_success() => StatusCode::Success,
            Ok(_) => StatusCode::Failed,
            Err(ToolError::Encoding(err)) => match err.field {
                error::EncodingField::Config => StatusCode::InvalidConfigText,
                error::EncodingField::ExcelPath => StatusCode::InvalidExcelPath,
                error::EncodingField::XmlDirPath => StatusCode::InvalidXmlDirPath,
            },
            Err(_) => StatusCode::Failed,
        }
    }
}

/// Updates the XML files under `xml_dir` from the workbook, one file at a
/// time.
pub fn update(cfg_json: &str, excel: &Path, xml_dir: &Path) -> Result<RunReport> {
    update_with(cfg_json, excel, xml_dir, Mode::Normal, &RunOptions::default())
}

/// Same contract as [`update`], trading memory for parallel planning.
pub fn quick_update(cfg_json: &str, excel: &Path, xml_dir: &Path) -> Result<RunReport> {
    update_with(cfg_json, excel, xml_dir, Mode::Quick, &RunOptions::default())
}

pub fn update_with(
    cfg_json: &str,
    excel: &Path,
    xml_dir: &Path,
    mode: Mode,
    options: &RunOptions,
) -> Result<RunReport> {
    let (config, parse_errors) = Config::from_json_partial(cfg_json)?;
    sync::run_with_errors(&config, parse_errors, excel, xml_dir, mode, options)
}

/// The default configuration as pretty JSON.
pub fn default_config_json() -> Result<String> {
    Ok(Config::default().to_json()?)
}

/// Sheet names of the workbook at `path`, in workbook order.
pub fn sheet_names(path: &Path) -> Result<Vec<String>> {
    io::excel_read::sheet_names(path)
}
