//! C ABI over the library entry points. Declarations live in
//! `include/excel_to_xml.h`.

use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use tracing::warn;

use crate::error::{EncodingError, EncodingField};
use crate::sync::{Mode, RunOptions};
use crate::{Result, RunReport, StatusCode, ToolError};

/// JSON report of the most recent run in this process.
static LAST_REPORT: Mutex<Option<String>> = Mutex::new(None);

/// Reads a NUL-terminated UTF-8 argument; null counts as invalid.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for reads.
unsafe fn read_arg<'a>(ptr: *const c_char, field: EncodingField) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(EncodingError { field }.into());
    }
    let text = unsafe { CStr::from_ptr(ptr) };
    text.to_str().map_err(|_| ToolError::from(EncodingError { field }))
}

/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
unsafe fn run(
    cfg_json: *const c_char,
    excel_path: *const c_char,
    xml_dir_path: *const c_char,
    mode: Mode,
) -> i32 {
    let outcome = (|| {
        let cfg_json = unsafe { read_arg(cfg_json, EncodingField::Config) }?;
        let excel_path = unsafe { read_arg(excel_path, EncodingField::ExcelPath) }?;
        let xml_dir_path = unsafe { read_arg(xml_dir_path, EncodingField::XmlDirPath) }?;
        crate::update_with(
            cfg_json,
            Path::new(excel_path),
            Path::new(xml_dir_path),
            mode,
            &RunOptions::default(),
        )
    })();

    if let Err(err) = &outcome {
        warn!(error = %err, "update failed");
    }
    remember(&outcome);
    StatusCode::from_outcome(&outcome).code()
}

fn remember(outcome: &Result<RunReport>) {
    let json = match outcome {
        Ok(report) => report.to_json().ok(),
        Err(err) => serde_json::to_string_pretty(&serde_json::json!({
            "status": "failed",
            "error": err.to_string(),
        }))
        .ok(),
    };
    if let Ok(mut last) = LAST_REPORT.lock() {
        *last = json;
    }
}

fn into_c_string(text: String) -> *mut c_char {
    match CString::new(text) {
        Ok(text) => text.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Updates XML files from the workbook in normal mode.
///
/// Returns 0 on success, -1/-2/-3 when the configuration text, workbook path
/// or directory path is null or not UTF-8, and -4 for any other failure.
///
/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn excel_to_xml_update(
    cfg_json: *const c_char,
    excel_path: *const c_char,
    xml_dir_path: *const c_char,
) -> i32 {
    unsafe { run(cfg_json, excel_path, xml_dir_path, Mode::Normal) }
}

/// Quick-mode variant of [`excel_to_xml_update`] with the same contract.
///
/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn excel_to_xml_quick_update(
    cfg_json: *const c_char,
    excel_path: *const c_char,
    xml_dir_path: *const c_char,
) -> i32 {
    unsafe { run(cfg_json, excel_path, xml_dir_path, Mode::Quick) }
}

/// Default configuration as JSON, or null on failure. Release with
/// [`excel_to_xml_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn excel_to_xml_get_default_config() -> *mut c_char {
    match crate::default_config_json() {
        Ok(json) => into_c_string(json),
        Err(err) => {
            warn!(error = %err, "failed to serialise default configuration");
            ptr::null_mut()
        }
    }
}

/// JSON report of the most recent run, or null when no run happened yet.
/// Release with [`excel_to_xml_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn excel_to_xml_last_report() -> *mut c_char {
    let last = match LAST_REPORT.lock() {
        Ok(last) => last.clone(),
        Err(_) => None,
    };
    last.map(into_c_string).unwrap_or(ptr::null_mut())
}

/// Releases a string returned by this library; null is ignored.
///
/// # Safety
/// `ptr` must be null or a pointer obtained from this library that was not
/// freed before.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn excel_to_xml_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr) });
}
