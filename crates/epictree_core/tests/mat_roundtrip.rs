use epictree_core::mat::{from_bytes, read_mat, to_bytes, WriteOptions};
use epictree_core::source::JsonDumpSource;
use epictree_core::transform::sanitize::{sanitize_map, NullPolicy};
use epictree_core::{Document, ExportOptions, ExportService, SourceAdapter, Value, ValueMap};
use serde_json::json;
use std::collections::BTreeSet;
use tempfile::tempdir;

fn epoch(id: i64, spot: i64) -> serde_json::Value {
    let frame_times: Vec<f64> = if id == 1 { vec![0.0, 16.5, 33.0] } else { Vec::new() };
    json!({
        "level": "epoch",
        "object": {
            "id": id,
            "h5_uuid": format!("uuid-{id}"),
            "parameters": {"spotSize": spot},
            "frame_times_ms": frame_times,
        },
        "responses": [{"device_name": "Amp1", "h5path": format!("/e{id}/Amp1"), "sample_rate": 10000}],
        "stimuli": [{"device_name": "LED", "stimulus_parameters": {"waveform": {"mean": 0.5}}}],
    })
}

fn dump() -> String {
    json!([
        {
            "level": "experiment",
            "object": {"id": 1, "exp_name": "20250101A", "data_file": "/data/20250101A.h5"},
            "tags": [{"user": "ab", "tag": "good", "id": 9}],
            "children": [{
                "level": "animal",
                "object": {"species": "macaque"},
                "children": [{
                    "level": "preparation",
                    "object": {"region": "periphery", "extra": {"slice": 2}},
                    "children": [
                        {
                            "level": "cell",
                            "object": {"id": 1, "label": "Cell1", "type": "OnP"},
                            "children": [{
                                "level": "epoch_group",
                                "object": {"id": 1, "protocol_name": "SingleSpot"},
                                "children": [{
                                    "level": "epoch_block",
                                    "object": {"id": 1, "parameters": {"preTime": 250, "stage": {"x": 1}}},
                                    "children": [epoch(1, 100), epoch(2, 200), epoch(3, 300)],
                                }],
                            }],
                        },
                        {"level": "cell", "object": {"id": 2, "label": "Cell2", "type": "RB"}},
                    ],
                }],
            }],
        },
        {
            "level": "experiment",
            "object": {"id": 2, "exp_name": "20250101B"},
            "children": [{"level": "cell", "object": {"id": 1, "label": "Cell1"}}],
        },
    ])
    .to_string()
}

fn counts(experiments: &[&ValueMap]) -> (usize, usize, usize, usize, usize) {
    let mut cells = 0;
    let mut groups = 0;
    let mut blocks = 0;
    let mut epochs = 0;
    for experiment in experiments {
        for cell in children(experiment, "cells") {
            cells += 1;
            for group in children(cell, "epoch_groups") {
                groups += 1;
                for block in children(group, "epoch_blocks") {
                    blocks += 1;
                    epochs += children(block, "epochs").len();
                }
            }
        }
    }
    (experiments.len(), cells, groups, blocks, epochs)
}

fn children<'a>(record: &'a ValueMap, key: &str) -> Vec<&'a ValueMap> {
    record.get(key).map(Value::records).unwrap_or_default()
}

fn parameter_keys(records: &[&ValueMap], key: &str) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(|record| record.get(key).and_then(Value::as_map))
        .flat_map(|map| map.keys().cloned())
        .collect()
}

fn document_counts(document: &Document) -> (usize, usize, usize, usize, usize) {
    let groups: Vec<_> = document
        .experiments
        .iter()
        .flat_map(|e| &e.cells)
        .flat_map(|c| &c.epoch_groups)
        .collect();
    let blocks: Vec<_> = groups.iter().flat_map(|g| &g.epoch_blocks).collect();
    (
        document.experiments.len(),
        document.cell_count(),
        groups.len(),
        blocks.len(),
        document.epoch_count(),
    )
}

#[test]
fn exported_file_reproduces_hierarchy_counts_and_parameter_keys() {
    let roots = JsonDumpSource::from_text("dump", dump())
        .load_experiments()
        .unwrap();
    let service = ExportService::new(ExportOptions::default());
    let (document, summary) = service.build_document(&roots, "ab").unwrap();

    let dir = tempdir().unwrap();
    let summary = service
        .write_document(&document, summary, dir.path())
        .unwrap();
    let path = summary.output.clone().expect("output path recorded");
    assert!(path.starts_with(dir.path()));

    let variables = read_mat(&path).unwrap();
    assert_eq!(variables.get("format_version"), Some(&Value::from("1.0")));
    let metadata = variables.get("metadata").and_then(Value::as_map).unwrap();
    assert_eq!(metadata.get("export_user"), Some(&Value::from("ab")));

    let experiments = variables.get("experiments").unwrap().records();
    assert_eq!(counts(&experiments), document_counts(&document));
    assert_eq!(counts(&experiments), (2, 3, 1, 1, 3));

    let cells: Vec<&ValueMap> = experiments
        .iter()
        .flat_map(|e| children(e, "cells"))
        .collect();
    let cell_keys: BTreeSet<String> = document
        .experiments
        .iter()
        .flat_map(|e| &e.cells)
        .flat_map(|c| c.properties.keys().cloned())
        .collect();
    assert_eq!(parameter_keys(&cells, "properties"), cell_keys);
    assert!(cell_keys.contains("species"));
    assert!(cell_keys.contains("region"));
    // Schema-bound levels contribute declared fields only.
    assert!(!cell_keys.contains("extra_slice"));

    let blocks: Vec<&ValueMap> = cells
        .iter()
        .flat_map(|c| children(c, "epoch_groups"))
        .flat_map(|g| children(g, "epoch_blocks"))
        .collect();
    assert_eq!(
        parameter_keys(&blocks, "parameters"),
        ["preTime", "stage_x"].iter().map(|k| k.to_string()).collect()
    );

    let epochs: Vec<&ValueMap> = blocks.iter().flat_map(|b| children(b, "epochs")).collect();
    assert_eq!(
        parameter_keys(&epochs, "parameters"),
        ["preTime", "spotSize", "stage_x"]
            .iter()
            .map(|k| k.to_string())
            .collect()
    );
    let uuids: Vec<String> = epochs
        .iter()
        .map(|e| e.get("h5_uuid").map(Value::to_text).unwrap_or_default())
        .collect();
    assert_eq!(uuids, vec!["uuid-1", "uuid-2", "uuid-3"]);
    assert_eq!(
        epochs[0].get("frame_times_ms"),
        Some(&Value::Array(vec![0.0, 16.5, 33.0]))
    );
    assert_eq!(epochs[1].get("frame_times_ms"), Some(&Value::Array(Vec::new())));

    let stimuli: Vec<&ValueMap> = epochs.iter().flat_map(|e| children(e, "stimuli")).collect();
    assert_eq!(
        parameter_keys(&stimuli, "stimulus_parameters"),
        ["waveform_mean".to_string()].into_iter().collect()
    );
}

#[test]
fn lazy_payloads_are_written_as_empty_sample_arrays() {
    let roots = JsonDumpSource::from_text("dump", dump())
        .load_experiments()
        .unwrap();
    let (document, _) = ExportService::new(ExportOptions::default())
        .build_document(&roots, "ab")
        .unwrap();

    let variables = sanitize_map(&document.to_value(), NullPolicy::EmptyText);
    let bytes = to_bytes(&variables, &WriteOptions { compress: false }).unwrap();
    let decoded = from_bytes(&bytes).unwrap();

    let experiments = decoded.get("experiments").unwrap().records();
    let response = children(experiments[0], "cells")
        .into_iter()
        .flat_map(|c| children(c, "epoch_groups"))
        .flat_map(|g| children(g, "epoch_blocks"))
        .flat_map(|b| children(b, "epochs"))
        .flat_map(|e| children(e, "responses"))
        .next()
        .expect("one response");

    assert_eq!(response.get("data"), Some(&Value::Array(Vec::new())));
    assert_eq!(response.get("data_loaded"), Some(&Value::Bool(false)));
    assert_eq!(response.get("h5_path"), Some(&Value::from("/e1/Amp1")));
    assert_eq!(
        response.get("h5_file"),
        Some(&Value::from("/data/20250101A.h5"))
    );
    assert_eq!(response.get("sample_rate"), Some(&Value::Float(10_000.0)));
}
