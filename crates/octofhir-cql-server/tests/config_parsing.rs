use std::{env, fs};

use octofhir_cql_server::config::loader::load_config;
use octofhir_cql_translator::OutputFormat;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("octofhir-cql.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
body_limit_bytes = 1024

[logging]
level = "debug"

[translator]
default_target_format = "application/elm+xml"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.server.body_limit_bytes, 1024);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.translator.default_format().unwrap(), OutputFormat::ElmXml);

    // 2) Env override wins over file
    unsafe {
        env::set_var("OCTOFHIR_CQL__SERVER__PORT", "9091");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.server.port, 9091);
    unsafe {
        env::remove_var("OCTOFHIR_CQL__SERVER__PORT");
    }

    // 3) Missing file falls back to defaults
    let missing = dir.path().join("missing.toml");
    let cfg_default = load_config(missing.to_str()).expect("defaults");
    assert_eq!(cfg_default.server.port, 8080);
    assert_eq!(cfg_default.translator.default_format().unwrap(), OutputFormat::ElmJson);

    // 4) Non-ELM default format is rejected
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[translator]
default_target_format = "application/json"
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("default_target_format"));
}
