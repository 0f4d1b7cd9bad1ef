use std::fs;

use addonup_config::LoadError;
use addonup_config::Options;
use addonup_config::render;
use tempfile::TempDir;

#[test]
fn test_missing_options_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");

    let err = Options::from_file(&path).unwrap_err();
    assert!(matches!(err, LoadError::Missing { .. }));
    assert_eq!(
        format!("{}", err),
        format!("No {} file", path.display())
    );
}

#[test]
fn test_load_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");
    fs::write(
        &path,
        r#"{
            "heisenbridge_owner_mxid": "@admin:example.com",
            "heisenbridge_synapse_url": "http://synapse:8008",
            "heisenbridge_own_url": "http://addon:9898"
        }"#,
    )
    .unwrap();

    let opts = Options::from_file(&path).unwrap();
    let mut scope = opts.scope();
    let owner = scope.require_str("heisenbridge_owner_mxid");
    let synapse = scope.require_str("heisenbridge_synapse_url");
    scope.finish().unwrap();

    assert_eq!(owner, "@admin:example.com");
    assert_eq!(synapse, "http://synapse:8008");
}

#[test]
fn test_parse_error_names_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");
    fs::write(&path, "not json at all").unwrap();

    let err = Options::from_file(&path).unwrap_err();
    assert!(matches!(err, LoadError::Parse { .. }));
    assert!(format!("{}", err).contains("options.json"));
}

#[test]
fn test_top_level_must_be_object() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");
    fs::write(&path, "[1, 2, 3]").unwrap();

    let err = Options::from_file(&path).unwrap_err();
    assert!(matches!(err, LoadError::NotAnObject { .. }));
}

#[test]
fn test_validation_errors_report_together() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");
    fs::write(&path, r#"{"stream_codec": 42}"#).unwrap();

    let opts = Options::from_file(&path).unwrap();
    let mut scope = opts.scope();
    scope.require_str("stream_codec");
    scope.require_u64("server_threads");
    let diagnostics = scope.finish().unwrap_err();

    let rendered = format!("{}", diagnostics);
    assert!(rendered.contains("stream_codec must be a string"));
    assert!(rendered.contains("server_threads is required"));
    assert!(rendered.contains(&path.display().to_string()));
}

#[test]
fn test_render_against_loaded_options() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("options.json");
    fs::write(
        &path,
        r#"{"server_name": "example.com", "report_stats": false}"#,
    )
    .unwrap();

    let opts = Options::from_file(&path).unwrap();
    let rendered = render(
        "server_name: \"{server_name}\"\nreport_stats: {report_stats}\n",
        &opts,
    )
    .unwrap();
    assert_eq!(
        rendered,
        "server_name: \"example.com\"\nreport_stats: false\n"
    );
}
