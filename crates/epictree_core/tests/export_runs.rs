use epictree_core::mat::read_mat;
use epictree_core::model::document::{SampleData, SampleRef};
use epictree_core::transform::resolve::{MemorySampleReader, ReadError, ResolveError};
use epictree_core::{
    read_selection_mask, ExportError, ExportOptions, ExportService, Level, Materialization,
    RawNode, SampleReader, SelectionMask, Value, ValueMap,
};
use tempfile::tempdir;

fn response(locator: &str) -> ValueMap {
    let mut record = ValueMap::new();
    record.insert("device_name".to_string(), Value::from("Amp1"));
    record.insert("h5path".to_string(), Value::from(locator));
    record
}

fn experiment(name: &str, is_mea: bool, locators: &[&str]) -> RawNode {
    let mut block = RawNode::new(Level::EpochBlock);
    for (index, locator) in locators.iter().enumerate() {
        block = block.with_child(
            RawNode::new(Level::Epoch)
                .with_field("h5_uuid", format!("{name}-{index}"))
                .with_response(response(locator)),
        );
    }

    RawNode::new(Level::Experiment)
        .with_field("exp_name", name)
        .with_field("is_mea", is_mea)
        .with_field("data_file", format!("/data/{name}.h5"))
        .with_child(
            RawNode::new(Level::Cell).with_child(RawNode::new(Level::EpochGroup).with_child(block)),
        )
}

struct FlakyReader;

impl SampleReader for FlakyReader {
    fn read_samples(&self, source: &SampleRef) -> Result<Vec<f64>, ReadError> {
        if source.locator.ends_with("/bad") {
            Err(ReadError::new("checksum mismatch"))
        } else {
            Ok(vec![source.locator.len() as f64])
        }
    }
}

#[test]
fn batch_runs_skip_failed_experiments_and_still_write() {
    let roots = vec![
        experiment("A", false, &["/a/1"]),
        experiment("MEA", true, &["/m/1"]),
        experiment("B", false, &["/b/1", "/b/2"]),
    ];
    let dir = tempdir().unwrap();
    let path = dir.path().join("batch.mat");

    let summary = ExportService::new(ExportOptions::default())
        .export(&roots, "ab", &path)
        .unwrap();
    assert_eq!(summary.exported, vec!["A".to_string(), "B".to_string()]);
    assert!(summary.is_partial());
    assert_eq!(summary.failures[0].experiment, "MEA");
    assert!(summary.failures[0].reason.contains("multi-electrode"));
    assert_eq!(summary.epoch_count, 3);
    assert_eq!(summary.output.as_deref(), Some(path.as_path()));

    let variables = read_mat(&path).unwrap();
    let experiments = variables.get("experiments").unwrap().records();
    let names: Vec<String> = experiments
        .iter()
        .map(|e| e.get("exp_name").map(Value::to_text).unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["A", "B"]);
    let ids: Vec<i64> = experiments
        .iter()
        .filter_map(|e| e.get("id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn batch_of_only_failures_has_nothing_to_export() {
    let roots = vec![
        experiment("M1", true, &[]),
        experiment("M2", true, &[]),
    ];
    let err = ExportService::new(ExportOptions::default())
        .build_document(&roots, "ab")
        .expect_err("nothing survives");
    match err {
        ExportError::NothingToExport { failures } => assert_eq!(failures.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn read_failures_degrade_to_lazy_references_with_warnings() {
    let roots = vec![experiment("A", false, &["/a/ok", "/a/bad", "/a/also-ok"])];
    let reader = FlakyReader;
    let service = ExportService::new(ExportOptions {
        materialization: Materialization::Eager { workers: 3 },
        ..ExportOptions::default()
    })
    .with_reader(&reader);

    let (document, summary) = service.build_document(&roots, "ab").unwrap();
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].locator, "/a/bad");
    assert_eq!(summary.warnings[0].file, "/data/A.h5");

    let payloads: Vec<_> = document
        .epochs()
        .map(|epoch| epoch.responses[0].payload.data.clone())
        .collect();
    assert_eq!(
        payloads,
        vec![
            SampleData::Inline(vec![5.0]),
            SampleData::Lazy,
            SampleData::Inline(vec![10.0]),
        ]
    );
}

#[test]
fn eager_mode_without_a_reader_is_rejected() {
    let roots = vec![experiment("A", false, &["/a/1"])];
    let err = ExportService::new(ExportOptions {
        materialization: Materialization::Eager { workers: 0 },
        ..ExportOptions::default()
    })
    .build_document(&roots, "ab")
    .expect_err("reader required");
    assert!(matches!(err, ExportError::Resolve(ResolveError::MissingReader)));
}

#[test]
fn lazy_mode_never_touches_the_reader() {
    let mut reader = MemorySampleReader::new();
    reader.insert("/data/A.h5", "/a/1", vec![1.0, 2.0]);
    let roots = vec![experiment("A", false, &["/a/1"])];

    let (document, summary) = ExportService::new(ExportOptions::default())
        .with_reader(&reader)
        .build_document(&roots, "ab")
        .unwrap();
    assert!(summary.warnings.is_empty());
    let payload = &document.experiments[0].cells[0].epoch_groups[0].epoch_blocks[0].epochs[0]
        .responses[0]
        .payload;
    assert_eq!(payload.data, SampleData::Lazy);
    assert_eq!(payload.source.locator, "/a/1");
}

#[test]
fn exported_epochs_seed_a_selection_mask() {
    let roots = vec![experiment("A", false, &["/a/1", "/a/2"])];
    let (document, _) = ExportService::new(ExportOptions::default())
        .build_document(&roots, "ab")
        .unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("A.ugm");
    let mut mask = SelectionMask::from_document(&document);
    mask.set_selected("A-1", false);
    mask.write(&path, &Default::default()).unwrap();

    let state = read_selection_mask(&path).unwrap();
    assert_eq!(state.epoch_count, 2);
    assert_eq!(state.selected_uuids, vec!["A-0".to_string()]);
    assert_eq!(state.excluded_uuids, vec!["A-1".to_string()]);
}
