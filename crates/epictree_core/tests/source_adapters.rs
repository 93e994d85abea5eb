use epictree_core::db::open_db_in_memory;
use epictree_core::source::{
    JsonDumpSource, MemoryGroup, RecordingFileSource, RecordingSampleReader, SqliteQuerySource,
};
use epictree_core::{
    flatten_experiment, ExportOptions, ExportService, FlattenOptions, Level, Materialization,
    SourceAdapter, Value,
};
use serde_json::json;

const RECORDING_FILE: &str = "/data/2025-12-02_F.h5";

fn response_group(samples: Vec<f64>) -> MemoryGroup {
    MemoryGroup::new()
        .with_attr("sampleRate", 10_000_i64)
        .with_attr("sampleRateUnits", "Hz")
        .with_attr("units", "pA")
        .with_dataset("data", Value::Array(samples))
}

fn epoch_group_for(cell_label: &str, epochs: &[(&str, f64)]) -> MemoryGroup {
    let mut epochs_group = MemoryGroup::new();
    for (key, value) in epochs {
        epochs_group = epochs_group.with_group(
            key,
            MemoryGroup::new()
                .with_attr("uuid", format!("uuid-{key}"))
                .with_attr("startTimeDotNetDateTimeOffsetTicks", 639_002_646_000_000_000_i64)
                .with_group(
                    "protocolParameters",
                    MemoryGroup::new().with_attr("spotSize", *value),
                )
                .with_group(
                    "responses",
                    MemoryGroup::new().with_group("Amp1-abc", response_group(vec![*value; 3])),
                ),
        );
    }

    MemoryGroup::new()
        .with_attr("label", "Control")
        .with_group(
            "source",
            MemoryGroup::new()
                .with_attr("label", cell_label)
                .with_group("properties", MemoryGroup::new().with_attr("type", "OnP")),
        )
        .with_group(
            "epochBlocks",
            MemoryGroup::new()
                .with_group(
                    "SingleSpot-1",
                    MemoryGroup::new()
                        .with_attr("protocolID", "edu.lab.protocols.SingleSpot")
                        .with_group(
                            "protocolParameters",
                            MemoryGroup::new().with_attr("preTime", 250_i64),
                        )
                        .with_group("epochs", epochs_group),
                )
                .with_group("Empty-2", MemoryGroup::new()),
        )
}

fn recording_root() -> MemoryGroup {
    let source = MemoryGroup::new()
        .with_group(
            "properties",
            MemoryGroup::new()
                .with_attr("species", "macaque")
                .with_attr("sex", "F"),
        )
        .with_group(
            "experiment",
            MemoryGroup::new().with_group(
                "epochGroups",
                MemoryGroup::new()
                    .with_group("epochGroup-1", epoch_group_for("c1", &[("epoch-1", 1.0), ("epoch-2", 2.0)]))
                    .with_group("epochGroup-2", epoch_group_for("c2", &[("epoch-1", 3.0)]))
                    .with_group("epochGroup-3", epoch_group_for("c1", &[("epoch-1", 4.0)])),
            ),
        );

    MemoryGroup::new().with_group(
        "experiment-abc",
        MemoryGroup::new()
            .with_attr("uuid", "exp-uuid")
            .with_group(
                "properties",
                MemoryGroup::new().with_attr("rig", "Rig B"),
            )
            .with_group("sources", MemoryGroup::new().with_group("source-1", source)),
    )
}

#[test]
fn recording_file_cells_are_grouped_by_source_label() {
    let root = recording_root();
    let roots = RecordingFileSource::new(&root, RECORDING_FILE)
        .load_experiments()
        .unwrap();
    assert_eq!(roots.len(), 1);

    let experiment = flatten_experiment(&roots[0], &FlattenOptions::default()).unwrap();
    assert_eq!(experiment.exp_name, "2025-12-02_F");
    assert_eq!(experiment.h5_uuid, "exp-uuid");
    assert_eq!(experiment.rig, "Rig B");
    assert_eq!(experiment.h5_file, RECORDING_FILE);

    let labels: Vec<_> = experiment.cells.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["c1", "c2"]);
    let first = &experiment.cells[0];
    assert_eq!(first.cell_type, "RGC\\ON-parasol");
    assert_eq!(first.properties.get("species"), Some(&Value::from("macaque")));
    assert_eq!(first.epoch_groups.len(), 2);

    let group = &first.epoch_groups[0];
    assert_eq!(group.protocol_name, "SingleSpot");
    // The block without epochs is skipped.
    assert_eq!(group.epoch_blocks.len(), 1);
    let epoch = &group.epoch_blocks[0].epochs[1];
    assert_eq!(epoch.h5_uuid, "uuid-epoch-2");
    assert_eq!(epoch.start_time, "2025-12-02 09:30:00");
    assert_eq!(epoch.parameters.get("preTime"), Some(&Value::Int(250)));
    assert_eq!(epoch.parameters.get("spotSize"), Some(&Value::Float(2.0)));

    let response = &epoch.responses[0];
    assert_eq!(response.device_name, "Amp1");
    assert_eq!(response.units, "pA");
    assert_eq!(
        response.payload.source.locator,
        "/experiment-abc/sources/source-1/experiment/epochGroups/epochGroup-1/epochBlocks/SingleSpot-1/epochs/epoch-2/responses/Amp1-abc"
    );
}

#[test]
fn recording_file_samples_are_read_eagerly_in_document_order() {
    let root = recording_root();
    let roots = RecordingFileSource::new(&root, RECORDING_FILE)
        .load_experiments()
        .unwrap();
    let reader = RecordingSampleReader::new(&root, RECORDING_FILE);
    let service = ExportService::new(ExportOptions {
        materialization: Materialization::Eager { workers: 2 },
        ..ExportOptions::default()
    })
    .with_reader(&reader);

    let (document, summary) = service.build_document(&roots, "ab").unwrap();
    assert!(summary.warnings.is_empty());
    let firsts: Vec<f64> = document
        .epochs()
        .map(|epoch| match &epoch.responses[0].payload.data {
            epictree_core::model::document::SampleData::Inline(samples) => samples[0],
            epictree_core::model::document::SampleData::Lazy => f64::NAN,
        })
        .collect();
    assert_eq!(firsts, vec![1.0, 2.0, 4.0, 3.0]);
}

#[test]
fn sqlite_rows_flatten_with_elided_animal_and_preparation() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        r#"
        INSERT INTO experiment (id, exp_name, is_mea, data_file) VALUES (1, '20250101C', 0, '/d/c.h5');
        INSERT INTO experiment (id, exp_name, is_mea) VALUES (2, '20250101M', 1);
        INSERT INTO animal (id, experiment_id, species, age) VALUES (1, 1, 'macaque', '12y');
        INSERT INTO preparation (id, animal_id, region, bath_solution) VALUES (1, 1, 'periphery', 'Ames');
        INSERT INTO cell (id, preparation_id, label, type, properties)
            VALUES (1, 1, 'Cell1', 'OffP', '{"eccentricity": {"mm": 7.5}}');
        INSERT INTO epoch_group (id, cell_id, label, protocol_name) VALUES (1, 1, 'Control', 'SingleSpot');
        INSERT INTO epoch_block (id, epoch_group_id, parameters)
            VALUES (1, 1, '{"preTime": 250, "spotSize": 100}');
        INSERT INTO epoch (id, epoch_block_id, h5_uuid, parameters) VALUES (1, 1, 'e1', '{"spotSize": 300}');
        INSERT INTO epoch (id, epoch_block_id, h5_uuid, parameters) VALUES (2, 1, 'e2', 'not json');
        INSERT INTO response (id, epoch_id, device_name, sample_rate, h5path)
            VALUES (1, 1, 'Amp1', '10 kHz', '/r/1');
        INSERT INTO stimulus (id, epoch_id, device_name, stimulus_parameters)
            VALUES (1, 1, 'LED', '{"mean": 0.5}');
        INSERT INTO tag (table_name, table_id, user, tag) VALUES ('epoch', 2, 'ab', 'noisy');
        "#,
    )
    .unwrap();

    let source = SqliteQuerySource::new(&conn);
    let roots = source.load_experiments().unwrap();
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0].children[0].level, Level::Other("animal".to_string()));

    let (document, summary) = ExportService::new(ExportOptions {
        data_source: source.describe(),
        ..ExportOptions::default()
    })
    .build_document(&roots, "ab")
    .unwrap();

    assert_eq!(summary.exported, vec!["20250101C".to_string()]);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].experiment, "20250101M");

    let cell = &document.experiments[0].cells[0];
    assert_eq!(cell.cell_type, "RGC\\OFF-parasol");
    assert_eq!(cell.properties.get("species"), Some(&Value::from("macaque")));
    assert_eq!(cell.properties.get("bath_solution"), Some(&Value::from("Ames")));
    assert_eq!(cell.properties.get("eccentricity_mm"), Some(&Value::Float(7.5)));

    let epochs = &cell.epoch_groups[0].epoch_blocks[0].epochs;
    assert_eq!(epochs[0].parameters.get("spotSize"), Some(&Value::Int(300)));
    assert_eq!(epochs[0].parameters.get("preTime"), Some(&Value::Int(250)));
    // Malformed blobs are treated as empty.
    assert_eq!(epochs[1].parameters.get("spotSize"), Some(&Value::Int(100)));
    assert_eq!(epochs[1].tags[0].tag, "noisy");

    assert_eq!(epochs[0].responses[0].sample_rate, 10_000.0);
    assert_eq!(epochs[0].responses[0].payload.source.file, "/d/c.h5");
    assert_eq!(
        epochs[0].stimuli[0].stimulus_parameters.get("mean"),
        Some(&Value::Float(0.5))
    );
}

#[test]
fn symphony_mea_documents_are_flagged_and_rejected() {
    let text = json!({
        "rig_type": "MEA",
        "animals": [{"preparations": [{"cells": [{"label": "c1"}]}]}],
    })
    .to_string();
    let roots = JsonDumpSource::from_text("2025-12-02_M", text)
        .load_experiments()
        .unwrap();
    assert_eq!(roots[0].field("is_mea"), Some(&Value::Bool(true)));
    assert!(flatten_experiment(&roots[0], &FlattenOptions::default()).is_err());
}
