use std::fs;
use std::path::Path;

use excel_to_xml::error::ConfigError;
use excel_to_xml::report::{FileStatus, IssueKind, RunStatus};
use excel_to_xml::{CancelToken, Mode, RunOptions, ToolError, quick_update, update, update_with};
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};
use tempfile::tempdir;

const ITEMS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<items>
    <!-- keep me -->
    <item id="1" sku="a-1"><name>OldSword</name><price>9</price></item>
</items>
"#;

fn write_items(path: &Path, rows: &[(f64, &str, f64)]) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Items").expect("sheet name");
    sheet.write_string(0, 0, "id").expect("header");
    sheet.write_string(0, 1, "name").expect("header");
    sheet.write_string(0, 2, "price").expect("header");
    for (index, (id, name, price)) in rows.iter().enumerate() {
        let row = index as u32 + 1;
        sheet.write_number(row, 0, *id).expect("id");
        sheet.write_string(row, 1, *name).expect("name");
        sheet.write_number(row, 2, *price).expect("price");
    }
    workbook.save(path).expect("workbook saved");
}

fn items_config(on_missing: &str, on_extra: &str, all_or_nothing: bool) -> String {
    format!(
        r#"{{
            "version": 1,
            "allOrNothing": {all_or_nothing},
            "rules": [{{
                "name": "items",
                "sheet": "Items",
                "files": "*.xml",
                "path": "/items/item",
                "key": {{ "column": "id", "target": "@id" }},
                "fields": [
                    {{ "column": "name", "target": "name" }},
                    {{ "column": "price", "target": "price", "type": "float" }}
                ],
                "onMissing": "{on_missing}",
                "onExtra": "{on_extra}"
            }}]
        }}"#
    )
}

struct Fixture {
    _dir: tempfile::TempDir,
    excel: std::path::PathBuf,
    xml_dir: std::path::PathBuf,
}

impl Fixture {
    fn new(rows: &[(f64, &str, f64)], files: &[(&str, &str)]) -> Self {
        let dir = tempdir().expect("temporary directory");
        let excel = dir.path().join("items.xlsx");
        write_items(&excel, rows);
        let xml_dir = dir.path().join("xml");
        for (relative, content) in files {
            let path = xml_dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("xml dir");
            }
            fs::write(path, content).expect("xml written");
        }
        Fixture { _dir: dir, excel, xml_dir }
    }

    fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.xml_dir.join(relative)).expect("xml read")
    }
}

fn scenario_rows() -> Vec<(f64, &'static str, f64)> {
    vec![(1.0, "Sword", 10.5), (2.0, "Shield", 7.0)]
}

#[test]
fn updates_existing_item_and_inserts_new_one() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let report = update(&items_config("insert", "keep", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.totals.updated, 1);
    assert_eq!(report.totals.inserted, 1);
    assert_eq!(report.totals.deleted, 0);
    assert_eq!(report.files[0].status, FileStatus::Updated);

    let xml = fixture.read("items.xml");
    assert!(xml.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
    assert!(xml.contains("<!-- keep me -->"));
    assert!(xml.contains(r#"<item id="1" sku="a-1"><name>Sword</name><price>10.5</price></item>"#));
    assert!(xml.contains(r#"<item id="2">"#));
    assert!(xml.contains("<name>Shield</name>"));
    assert!(xml.contains("<price>7</price>"));
}

#[test]
fn deletes_items_without_rows() {
    let xml = ITEMS_XML.replace(
        "</items>",
        "    <item id=\"3\"><name>Bow</name><price>4</price></item>\n</items>",
    );
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", xml.as_str())]);
    let report = update(&items_config("insert", "delete", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.totals.deleted, 1);
    let xml = fixture.read("items.xml");
    assert!(!xml.contains(r#"id="3""#));
    assert!(xml.contains(r#"id="1""#));
    assert!(xml.contains(r#"id="2""#));
}

#[test]
fn second_run_changes_nothing() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let config = items_config("insert", "delete", false);
    update(&config, &fixture.excel, &fixture.xml_dir).expect("first run");
    let after_first = fixture.read("items.xml");

    let report = update(&config, &fixture.excel, &fixture.xml_dir).expect("second run");
    assert_eq!(report.totals.inserted + report.totals.updated + report.totals.deleted, 0);
    assert_eq!(report.files[0].status, FileStatus::Unchanged);
    assert_eq!(fixture.read("items.xml"), after_first);
}

#[test]
fn normal_and_quick_modes_agree() {
    let files = [
        ("items.xml", ITEMS_XML.to_string()),
        (
            "shop/items.xml",
            ITEMS_XML.replace("OldSword", "Sword").replace("a-1", "b-7"),
        ),
        ("other.xml", "<catalogue><entry/></catalogue>\n".to_string()),
    ];
    let files: Vec<(&str, &str)> = files.iter().map(|(path, xml)| (*path, xml.as_str())).collect();
    let normal = Fixture::new(&scenario_rows(), &files);
    let quick = Fixture::new(&scenario_rows(), &files);
    let config = items_config("insert", "keep", false);

    let normal_report = update(&config, &normal.excel, &normal.xml_dir).expect("normal run");
    let quick_report = quick_update(&config, &quick.excel, &quick.xml_dir).expect("quick run");

    assert_eq!(normal_report.totals, quick_report.totals);
    assert_eq!(normal_report.files, quick_report.files);
    for (relative, _) in &files {
        assert_eq!(normal.read(relative), quick.read(relative));
    }
}

#[test]
fn duplicate_keys_are_rejected_before_any_write() {
    let rows = vec![(1.0, "Sword", 10.5), (1.0, "Shield", 7.0)];
    let fixture = Fixture::new(&rows, &[("items.xml", ITEMS_XML)]);
    for quick in [false, true] {
        let config = items_config("insert", "delete", false);
        let outcome = if quick {
            quick_update(&config, &fixture.excel, &fixture.xml_dir)
        } else {
            update(&config, &fixture.excel, &fixture.xml_dir)
        };
        match outcome {
            Err(ToolError::Config(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    errors.iter().next(),
                    Some(ConfigError::DuplicateKeyColumn { first_row: 2, second_row: 3, .. })
                ));
            }
            other => panic!("expected duplicate key error, got {other:?}"),
        }
        assert_eq!(fixture.read("items.xml"), ITEMS_XML);
    }
}

#[test]
fn skip_policy_records_rows_without_nodes() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let report = update(&items_config("skip", "keep", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.totals.inserted, 0);
    assert_eq!(report.totals.updated, 1);
    assert_eq!(report.totals.skipped, 1);
    assert_eq!(report.files[0].skipped[0].key, "2");
    assert!(!fixture.read("items.xml").contains(r#"id="2""#));
}

#[test]
fn error_policy_fails_the_run_but_applies_other_rows() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let report = update(&items_config("error", "keep", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.status, RunStatus::Failed);
    let issues = &report.files[0].issues;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::MappingPolicy);
    assert_eq!(issues[0].key.as_deref(), Some("2"));
    assert!(fixture.read("items.xml").contains("<name>Sword</name>"));
}

#[test]
fn malformed_file_fails_alone() {
    let fixture = Fixture::new(
        &scenario_rows(),
        &[("a/items.xml", ITEMS_XML), ("b/items.xml", "<items><item id=\"1\"></items>")],
    );
    let report = update(&items_config("insert", "keep", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.files[0].path, "a/items.xml");
    assert_eq!(report.files[0].status, FileStatus::Updated);
    assert_eq!(report.files[1].status, FileStatus::Failed);
    assert_eq!(report.files[1].issues[0].kind, IssueKind::XmlParse);
    assert!(fixture.read("a/items.xml").contains("<name>Sword</name>"));
}

#[test]
fn all_or_nothing_withholds_every_write_in_quick_mode() {
    let fixture = Fixture::new(
        &scenario_rows(),
        &[("a/items.xml", ITEMS_XML), ("b/items.xml", "<items><item id=\"1\"></items>")],
    );
    let config = items_config("insert", "keep", true);
    let report = quick_update(&config, &fixture.excel, &fixture.xml_dir).expect("run completed");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.totals.files_failed, 2);
    assert_eq!(fixture.read("a/items.xml"), ITEMS_XML);
}

#[test]
fn ignored_directories_are_not_touched() {
    let fixture = Fixture::new(
        &scenario_rows(),
        &[("items.xml", ITEMS_XML), ("build/items.xml", ITEMS_XML)],
    );
    let report = update(&items_config("insert", "keep", false), &fixture.excel, &fixture.xml_dir)
        .expect("run completed");

    assert_eq!(report.files.len(), 1);
    assert_eq!(fixture.read("build/items.xml"), ITEMS_XML);
}

#[test]
fn unknown_sheet_and_column_are_reported_together() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let config = r#"{
        "rules": [
            { "name": "a", "sheet": "Nope", "files": "*.xml", "path": "/items/item",
              "key": { "column": "id", "target": "@id" } },
            { "name": "b", "sheet": "Items", "files": "*.xml", "path": "/items/item",
              "key": { "column": "id", "target": "@id" },
              "fields": [ { "column": "colour", "target": "colour" } ] }
        ]
    }"#;
    match update(config, &fixture.excel, &fixture.xml_dir) {
        Err(ToolError::Config(errors)) => {
            let errors: Vec<&ConfigError> = errors.iter().collect();
            assert_eq!(errors.len(), 2);
            assert!(matches!(errors[0], ConfigError::UnknownSheet { rule, .. } if rule == "a"));
            assert!(matches!(
                errors[1],
                ConfigError::UnknownColumn { column, .. } if column == "'colour'"
            ));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert_eq!(fixture.read("items.xml"), ITEMS_XML);
}

#[test]
fn cancelled_run_touches_no_file() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let options = RunOptions { cancel };
    for mode in [Mode::Normal, Mode::Quick] {
        let report = update_with(
            &items_config("insert", "keep", false),
            &fixture.excel,
            &fixture.xml_dir,
            mode,
            &options,
        )
        .expect("run completed");
        assert!(report.cancelled);
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.files.is_empty());
        assert_eq!(fixture.read("items.xml"), ITEMS_XML);
    }
}

#[test]
fn configuration_errors_from_every_stage_are_reported_together() {
    let fixture = Fixture::new(&scenario_rows(), &[("items.xml", ITEMS_XML)]);
    let config = r#"{
        "rules": [
            { "name": "broken", "files": "*.xml", "path": "/items/item",
              "key": { "column": "id", "target": "@id" }, "onMissing": "maybe" },
            { "name": "a", "sheet": "Items", "files": "*.xml", "path": "items/item",
              "key": { "column": "id", "target": "@id" } },
            { "name": "b", "sheet": "Nope", "files": "*.xml", "path": "/items/item",
              "key": { "column": "id", "target": "@id" } },
            { "name": "c", "sheet": "Items", "files": "*.xml", "path": "/items/item",
              "key": { "column": "id", "target": "@id" },
              "fields": [ { "column": "colour", "target": "colour" } ] }
        ]
    }"#;
    for mode in [Mode::Normal, Mode::Quick] {
        match update_with(config, &fixture.excel, &fixture.xml_dir, mode, &RunOptions::default()) {
            Err(ToolError::Config(errors)) => {
                let errors: Vec<&ConfigError> = errors.iter().collect();
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(matches!(errors[0], ConfigError::MalformedSchema(_)));
                assert!(matches!(
                    errors[1],
                    ConfigError::InvalidPathExpression { rule, .. } if rule == "a"
                ));
                assert!(matches!(errors[2], ConfigError::UnknownSheet { rule, .. } if rule == "b"));
                assert!(matches!(
                    errors[3],
                    ConfigError::UnknownColumn { rule, column, .. }
                        if rule == "c" && column == "'colour'"
                ));
            }
            other => panic!("expected configuration errors, got {other:?}"),
        }
        assert_eq!(fixture.read("items.xml"), ITEMS_XML);
    }
}

#[test]
fn bad_cell_excludes_only_its_row_and_keeps_its_node() {
    let xml = ITEMS_XML.replace(
        "</items>",
        "    <item id=\"3\"><name>Bow</name><price>4</price></item>\n</items>",
    );
    let build = || {
        let fixture = Fixture::new(&scenario_rows(), &[("items.xml", xml.as_str())]);
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Items").expect("sheet name");
        for (column, header) in ["id", "name", "price"].iter().enumerate() {
            sheet.write_string(0, column as u16, *header).expect("header");
        }
        for (index, (id, name, price)) in scenario_rows().iter().enumerate() {
            let row = index as u32 + 1;
            sheet.write_number(row, 0, *id).expect("id");
            sheet.write_string(row, 1, *name).expect("name");
            sheet.write_number(row, 2, *price).expect("price");
        }
        sheet.write_number(3, 0, 3.0).expect("id");
        sheet.write_string(3, 1, "Longbow").expect("name");
        sheet.write_string(3, 2, "cheap").expect("price");
        workbook.save(&fixture.excel).expect("workbook saved");
        fixture
    };
    let normal = build();
    let quick = build();
    let config = items_config("insert", "delete", false);

    let normal_report = update(&config, &normal.excel, &normal.xml_dir).expect("normal run");
    let quick_report = quick_update(&config, &quick.excel, &quick.xml_dir).expect("quick run");

    for (report, fixture) in [(&normal_report, &normal), (&quick_report, &quick)] {
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.totals.updated, 1);
        assert_eq!(report.totals.inserted, 1);
        assert_eq!(report.totals.deleted, 0);
        assert_eq!(report.workbook_issues.len(), 1);
        let issue = &report.workbook_issues[0];
        assert_eq!(issue.sheet, "Items");
        assert_eq!(issue.row, 4);
        assert_eq!(issue.column, "'price'");

        let xml = fixture.read("items.xml");
        assert!(xml.contains(r#"<item id="3"><name>Bow</name><price>4</price></item>"#));
        assert!(!xml.contains("Longbow"));
        assert!(xml.contains("<name>Sword</name>"));
        assert!(xml.contains(r#"<item id="2">"#));
    }
    assert_eq!(normal.read("items.xml"), quick.read("items.xml"));
}

#[test]
fn workbook_date_cells_are_written_as_dates() {
    let dir = tempdir().expect("temporary directory");
    let excel = dir.path().join("releases.xlsx");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Releases").expect("sheet name");
    sheet.write_string(0, 0, "id").expect("header");
    sheet.write_string(0, 1, "date").expect("header");
    sheet.write_number(1, 0, 1.0).expect("id");
    let date = ExcelDateTime::from_ymd(2024, 1, 1).expect("valid date");
    let format = Format::new().set_num_format("yyyy-mm-dd");
    sheet.write_datetime_with_format(1, 1, &date, &format).expect("date");
    workbook.save(&excel).expect("workbook saved");

    let xml_dir = dir.path().join("xml");
    fs::create_dir_all(&xml_dir).expect("xml dir");
    let source = "<releases>\n    <release id=\"1\" date=\"2023-12-31\"/>\n</releases>\n";
    fs::write(xml_dir.join("releases.xml"), source).expect("xml written");

    let config = r#"{
        "rules": [{
            "sheet": "Releases",
            "files": "releases.xml",
            "path": "/releases/release",
            "key": { "column": "id", "target": "@id" },
            "fields": [ { "column": "date", "target": "@date", "type": "date" } ]
        }]
    }"#;
    let report = update(config, &excel, &xml_dir).expect("run completed");

    assert_eq!(report.status, RunStatus::Success);
    assert!(report.workbook_issues.is_empty());
    assert_eq!(report.totals.updated, 1);
    let xml = fs::read_to_string(xml_dir.join("releases.xml")).expect("xml read");
    assert!(xml.contains(r#"<release id="1" date="2024-01-01"/>"#));
}
