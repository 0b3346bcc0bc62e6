//! Scenario file loading and replay.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::io::Write;
use tempfile::NamedTempFile;

use deepcopy_rs::{Config, Scenario, ScenarioError};

fn scenario_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_load_and_run_scenario_file() {
    let json = format!(
        r#"{{
            "object_size": 256,
            "object_number": 2,
            "steps": [
                {{"ops": [{{"op": "write", "offset": 0, "data": "{}"}}], "snapshot": true}},
                {{"ops": [{{"op": "zero", "offset": 2, "length": 4}}], "snapshot": true}},
                {{"ops": [{{"op": "truncate", "offset": 3}}]}}
            ]
        }}"#,
        BASE64.encode(b"deep copy")
    );
    let file = scenario_file(&json);

    let scenario = Scenario::load(file.path()).unwrap();
    let report = scenario.run().await.unwrap();

    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
    assert_eq!(report.dst_oid, "rbd_data.dst.0000000000000002");
    assert_eq!(report.snapshots.len(), 3);
    assert_eq!(report.reads, 2);

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["result_code"], 0);
    assert_eq!(value["snapshots"][0]["dst_snap"], "101");
    assert_eq!(value["snapshots"][0]["object_state"], "exists");
    assert_eq!(
        value["snapshots"][0]["src_sha256"],
        value["snapshots"][0]["dst_sha256"]
    );
}

#[tokio::test]
async fn test_config_disables_object_map() {
    let json = format!(
        r#"{{"object_size": 64, "steps": [{{"ops": [{{"op": "write", "offset": 8, "data": "{}"}}]}}]}}"#,
        BASE64.encode([1u8; 8])
    );
    let file = scenario_file(&json);

    let mut scenario = Scenario::load(file.path()).unwrap();
    scenario.apply_config(&Config {
        disable_object_map: true,
        ..Config::default()
    });
    let report = scenario.run().await.unwrap();

    assert_eq!(report.result_code, 0);
    assert!(report.matches);
    assert_eq!(report.snapshots.len(), 1);
    assert_eq!(report.snapshots[0].object_state, None);
}

#[tokio::test]
async fn test_clone_scenario_file() {
    let json = format!(
        r#"{{
            "object_size": 64,
            "flatten": true,
            "parent": {{"data": "{}", "overlap": 48}},
            "steps": [
                {{"snapshot": true}},
                {{"ops": [{{"op": "write", "offset": 60, "data": "{}"}}]}}
            ]
        }}"#,
        BASE64.encode([0x5a; 64]),
        BASE64.encode([0x11; 4])
    );
    let file = scenario_file(&json);

    let report = Scenario::load(file.path()).unwrap().run().await.unwrap();
    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
}

#[test]
fn test_load_errors() {
    assert!(matches!(
        Scenario::load("/nonexistent/scenario.json"),
        Err(ScenarioError::Io(_))
    ));

    let file = scenario_file("{\"steps\": [");
    assert!(matches!(Scenario::load(file.path()), Err(ScenarioError::Json(_))));

    let file = scenario_file(r#"{"steps": [{"ops": [{"op": "rename"}]}]}"#);
    assert!(matches!(Scenario::load(file.path()), Err(ScenarioError::Json(_))));
}
