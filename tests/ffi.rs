use std::ffi::{CStr, CString};
use std::fs;
use std::sync::Mutex;

use excel_to_xml::ffi::{
    excel_to_xml_free_string, excel_to_xml_last_report, excel_to_xml_quick_update,
    excel_to_xml_update,
};
use rust_xlsxwriter::Workbook;
use tempfile::tempdir;

const CONFIG: &str = r#"{
    "rules": [{
        "sheet": "",
        "files": "strings.xml",
        "path": "/resources/string",
        "key": { "column": "key", "target": "@name" },
        "fields": [ { "column": "text", "target": ".", "escapeNewlines": true } ],
        "onMissing": "insert"
    }]
}"#;

const STRINGS_XML: &str = concat!(
    "<resources>\n",
    "    <string name=\"hello\" translatable=\"false\">Hi</string>\n",
    "</resources>\n",
);

// The last report is process-wide; tests touching it run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn last_report() -> String {
    let raw = excel_to_xml_last_report();
    assert!(!raw.is_null());
    let json = unsafe { CStr::from_ptr(raw) }.to_str().expect("utf-8").to_string();
    unsafe { excel_to_xml_free_string(raw) };
    json
}

#[test]
fn update_through_the_c_abi() {
    let _serial = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempdir().expect("temporary directory");
    let excel = dir.path().join("strings.xlsx");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "key").expect("header");
    sheet.write_string(0, 1, "text").expect("header");
    sheet.write_string(1, 0, "hello").expect("key");
    sheet.write_string(1, 1, "Hello").expect("text");
    sheet.write_string(2, 0, "bye").expect("key");
    sheet.write_string(2, 1, "Good\nbye").expect("text");
    workbook.save(&excel).expect("workbook saved");

    let xml_dir = dir.path().join("res");
    fs::create_dir_all(&xml_dir).expect("xml dir");
    fs::write(xml_dir.join("strings.xml"), STRINGS_XML).expect("xml written");

    let cfg = CString::new(CONFIG).expect("cstring");
    let excel = CString::new(excel.to_str().expect("utf-8 path")).expect("cstring");
    let xml_dir_c = CString::new(xml_dir.to_str().expect("utf-8 path")).expect("cstring");

    let code = unsafe { excel_to_xml_update(cfg.as_ptr(), excel.as_ptr(), xml_dir_c.as_ptr()) };
    assert_eq!(code, 0);

    let xml = fs::read_to_string(xml_dir.join("strings.xml")).expect("xml read");
    assert!(xml.contains(r#"<string name="hello" translatable="false">Hello</string>"#));
    assert!(xml.contains(r#"<string name="bye">Good\nbye</string>"#));

    let code =
        unsafe { excel_to_xml_quick_update(cfg.as_ptr(), excel.as_ptr(), xml_dir_c.as_ptr()) };
    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(xml_dir.join("strings.xml")).expect("xml read"), xml);
}

#[test]
fn invalid_utf8_configuration_returns_minus_one_without_writing() {
    let _serial = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempdir().expect("temporary directory");
    let xml_path = dir.path().join("strings.xml");
    fs::write(&xml_path, STRINGS_XML).expect("xml written");

    let cfg = CString::new(vec![b'{', 0xc3, 0x28, b'}']).expect("cstring");
    let excel = CString::new("missing.xlsx").expect("cstring");
    let xml_dir = CString::new(dir.path().to_str().expect("utf-8 path")).expect("cstring");

    let code = unsafe { excel_to_xml_update(cfg.as_ptr(), excel.as_ptr(), xml_dir.as_ptr()) };
    assert_eq!(code, -1);
    assert_eq!(fs::read_to_string(&xml_path).expect("xml read"), STRINGS_XML);
}

#[test]
fn failed_run_returns_minus_four_and_a_report() {
    let _serial = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempdir().expect("temporary directory");
    let cfg = CString::new(CONFIG).expect("cstring");
    let missing = dir.path().join("missing.xlsx");
    let excel = CString::new(missing.to_str().expect("utf-8 path")).expect("cstring");
    let xml_dir = CString::new(dir.path().to_str().expect("utf-8 path")).expect("cstring");

    let code = unsafe { excel_to_xml_update(cfg.as_ptr(), excel.as_ptr(), xml_dir.as_ptr()) };
    assert_eq!(code, -4);
    assert!(last_report().contains("\"status\": \"failed\""));
}
