use std::path::Path;

use csrbridge::BridgeConfig;
use csrbridge_probe::{run_probe, ProbeRequest, CSR_PROBE_REPORT_SCHEMA_VERSION};

fn config(cores: usize) -> BridgeConfig {
    BridgeConfig {
        cores,
        ..BridgeConfig::default()
    }
}

fn write_request(dir: &Path, body: &str) -> ProbeRequest {
    let path = dir.join("request.json");
    std::fs::write(&path, body).expect("write request");
    ProbeRequest::from_path(&path).expect("load request")
}

#[test]
fn probe_generates_and_leaves_nothing_live() {
    let dir = tempfile::tempdir().expect("tempdir");
    let req = write_request(
        dir.path(),
        r#"{"private_key":"k","parameters":{"subject":"CN=probe","dns":"probe.example"}}"#,
    );

    let report = run_probe(&config(2), &req, 1, 1).expect("run probe");
    assert_eq!(report.schema_version, CSR_PROBE_REPORT_SCHEMA_VERSION);
    assert!(report.ok, "{:?}", report.error);
    assert_eq!(report.core, 1);
    assert_eq!(report.module, "csr");

    let csr = report.csr.as_deref().unwrap();
    assert!(csr.contains("subject: CN=probe\n"));
    assert!(csr.contains("dns: probe.example\n"));

    // key + two parameters allocated by the host; their frees plus the output free.
    assert_eq!(report.guest_mallocs, 3);
    assert_eq!(report.guest_frees, 4);
    assert_eq!(report.guest_live_after, 0);
}

#[test]
fn probe_reports_empty_key_as_empty_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let req = write_request(dir.path(), r#"{"private_key":""}"#);

    let report = run_probe(&config(1), &req, 0, 1).expect("run probe");
    assert!(!report.ok);
    assert_eq!(report.error.as_ref().map(|e| e.kind), Some("empty_result"));
    assert_eq!(report.guest_live_after, 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["error"]["kind"], "empty_result");
}

#[test]
fn probe_rejects_core_outside_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let req = write_request(dir.path(), r#"{"private_key":"k"}"#);
    let err = run_probe(&config(1), &req, 5, 1).unwrap_err();
    assert!(format!("{err:#}").contains("out of range"));
}

#[test]
fn request_with_unknown_field_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("request.json");
    std::fs::write(&path, r#"{"private_key":"k","parameters":{"cn":"x"}}"#).unwrap();
    let err = ProbeRequest::from_path(&path).unwrap_err();
    assert!(format!("{err:#}").contains("parse request JSON"));
}
