mod common;

use common::test_helpers::{mzid_document, test_context, write_mirror_file};
use mzid_mirror::ledger::{self, SchemaVerdict};
use mzid_mirror::report::ReportBuilder;
use tempfile::TempDir;

fn populate(root: &std::path::Path) {
    write_mirror_file(root, "2024/03/PXD000001", "plain.mzid", &mzid_document(false, "1.2.0"));
    write_mirror_file(root, "2024/03/PXD000001", "linked.mzid", &mzid_document(true, "1.2.0"));
    write_mirror_file(root, "23/11/PXD000002", "broken.mzid", "<MzIdentML><unclosed></MzIdentML>");
}

#[tokio::test]
async fn test_ledger_rows_describe_mirrored_files() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let builder = ReportBuilder::new(test_context(dir.path()));

    let stats = builder.build_or_update().await.unwrap();
    assert_eq!(stats.appended, 3);
    assert_eq!(stats.already_present, 0);

    let rows = ledger::read_rows(builder.ledger_path()).unwrap();
    assert_eq!(rows.len(), 3);

    let linked = rows.iter().find(|row| row.file_name == "linked.mzid").unwrap();
    assert_eq!(linked.project, "PXD000001");
    assert_eq!(linked.date, "2024-03-01");
    assert!(linked.contains_marker);
    assert!(linked.parseable);
    assert_eq!(linked.schema_version, "1.2.0");
    assert_eq!(linked.schema_valid, SchemaVerdict::Unknown);
    assert!(linked.size_bytes().is_some());

    let plain = rows.iter().find(|row| row.file_name == "plain.mzid").unwrap();
    assert!(!plain.contains_marker);

    let broken = rows.iter().find(|row| row.file_name == "broken.mzid").unwrap();
    assert_eq!(broken.date, "2023-11-01");
    assert!(!broken.parseable);
    assert!(!broken.error_message.is_empty());
    assert!(broken.schema_version.is_empty());
}

#[tokio::test]
async fn test_second_run_appends_nothing() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let builder = ReportBuilder::new(test_context(dir.path()));

    builder.build_or_update().await.unwrap();
    let before = std::fs::read(builder.ledger_path()).unwrap();

    let stats = builder.build_or_update().await.unwrap();
    assert_eq!(stats.appended, 0);
    assert_eq!(stats.already_present, 3);
    assert_eq!(std::fs::read(builder.ledger_path()).unwrap(), before);
}

#[tokio::test]
async fn test_new_files_are_appended_after_existing_rows() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let builder = ReportBuilder::new(test_context(dir.path()));
    builder.build_or_update().await.unwrap();

    write_mirror_file(dir.path(), "2024/04/PXD000003", "late.mzid", &mzid_document(false, "1.1.0"));
    let stats = builder.build_or_update().await.unwrap();
    assert_eq!(stats.appended, 1);

    let rows = ledger::read_rows(builder.ledger_path()).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].file_name, "late.mzid");
    assert_eq!(rows[3].schema_version, "1.1.0");
}

#[tokio::test]
async fn test_bookkeeping_files_are_ignored() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    write_mirror_file(dir.path(), "2024/03/PXD000001", "pending.mzid.part", "<Mz");
    write_mirror_file(dir.path(), "2024/03/PXD000001", "pride_metadata.json", "{}");
    write_mirror_file(dir.path(), "2024/03/PXD000001", "bundle.zip", "not really a zip");
    let builder = ReportBuilder::new(test_context(dir.path()));

    builder.build_or_update().await.unwrap();
    builder.regenerate_subset().await.unwrap();
    let stats = builder.build_or_update().await.unwrap();

    // The ledger and the subset are themselves files in the mirror root
    assert_eq!(stats.ignored, 5);
    let rows = ledger::read_rows(builder.ledger_path()).unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_subset_holds_marker_rows_only() {
    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let builder = ReportBuilder::new(test_context(dir.path()));
    builder.build_or_update().await.unwrap();

    let count = builder.regenerate_subset().await.unwrap();
    assert_eq!(count, 1);
    let subset = ledger::read_rows(builder.subset_path()).unwrap();
    assert_eq!(subset.len(), 1);
    assert_eq!(subset[0].file_name, "linked.mzid");

    let header = std::fs::read_to_string(builder.subset_path()).unwrap();
    assert!(header.starts_with("project,date,file_name,file_size,contains_MS1002511,"));

    // Regenerating replaces rather than appends
    assert_eq!(builder.regenerate_subset().await.unwrap(), 1);
    assert_eq!(ledger::read_rows(builder.subset_path()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_subset_without_ledger() {
    let dir = TempDir::new().unwrap();
    let builder = ReportBuilder::new(test_context(dir.path()));

    assert_eq!(builder.regenerate_subset().await.unwrap(), 0);
    assert!(!builder.subset_path().exists());
}

#[tokio::test]
async fn test_interrupted_append_loses_only_the_last_row() {
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    populate(dir.path());
    let builder = ReportBuilder::new(test_context(dir.path()));
    builder.build_or_update().await.unwrap();

    // Crash in the middle of writing a row
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(builder.ledger_path())
        .unwrap();
    file.write_all(b"PXD000001,2024-03-01,b.mz").unwrap();
    drop(file);

    write_mirror_file(dir.path(), "2024/04/PXD000003", "late.mzid", &mzid_document(false, "1.1.0"));
    let stats = builder.build_or_update().await.unwrap();
    assert_eq!(stats.appended, 1);
    assert_eq!(stats.already_present, 3);

    let rows = ledger::read_rows(builder.ledger_path()).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].file_name, "late.mzid");
    assert!(rows.iter().all(|row| row.file_name != "b.mz"));

    let content = std::fs::read_to_string(builder.ledger_path()).unwrap();
    assert!(!content.contains("b.mz,"));
    assert!(content.ends_with('\n'));
    assert_eq!(builder.regenerate_subset().await.unwrap(), 1);
}

#[tokio::test]
async fn test_archive_members_in_subfolders_keep_their_collection() {
    use mzid_mirror::extractor::ArchiveExtractor;
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let collection = dir.path().join("2024/05/PXD000004");
    std::fs::create_dir_all(&collection).unwrap();

    let mut writer = zip::ZipWriter::new(std::fs::File::create(collection.join("results.zip")).unwrap());
    writer
        .start_file("results/nested.mzid", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(mzid_document(true, "1.2.0").as_bytes()).unwrap();
    writer.finish().unwrap();

    let context = test_context(dir.path());
    let extraction = ArchiveExtractor::new(context.clone(), dir.path(), ".mzid")
        .run()
        .await
        .unwrap();
    assert_eq!(extraction.extracted.len(), 1);
    assert!(collection.join("results/nested.mzid").exists());

    let builder = ReportBuilder::new(context);
    let stats = builder.build_or_update().await.unwrap();
    assert_eq!(stats.appended, 1);

    let rows = ledger::read_rows(builder.ledger_path()).unwrap();
    assert_eq!(rows[0].project, "PXD000004");
    assert_eq!(rows[0].date, "2024-05-01");
    assert_eq!(rows[0].file_name, "nested.mzid");
    assert!(rows[0].contains_marker);
}
