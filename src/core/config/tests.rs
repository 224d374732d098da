use super::data::{Config, IngressProvider, Platform};
use super::io::ConfigError;
use crate::core::transport::TransportId;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config, Config::default());
    assert_eq!(
        config.transport_order(),
        vec![TransportId::Local, TransportId::Relay]
    );
}

#[test]
fn partial_file_keeps_defaults_for_missing_fields() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
platform = "web"

[relay]
base_url = "https://relay.example.com"

[connection]
priority = ["relay", "local"]
max_reconnect_attempts = 3
"#,
    )
    .expect("write config");

    let config = Config::load_from_path(&config_path).expect("load");

    assert_eq!(config.platform, Platform::Web);
    assert_eq!(config.relay.base_url, "https://relay.example.com");
    assert_eq!(config.relay.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.local.probe_timeout(), Duration::from_secs(3));
    assert_eq!(config.connection.retry_policy().max_attempts, 3);
    assert_eq!(
        config.transport_order(),
        vec![TransportId::Relay, TransportId::Local]
    );
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.ingress.enabled = true;
    config.ingress.provider = IngressProvider::Cloudflared;
    config.logging.level = Some("debug".to_string());
    config
        .save_to_path(&config_path)
        .expect("Failed to save config");

    let loaded = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(loaded, config);
    assert_eq!(
        loaded.transport_order(),
        vec![TransportId::Local, TransportId::Relay, TransportId::Ingress]
    );

    let mut modified = loaded;
    modified.ingress.enabled = false;
    modified.save_to_path(&config_path).expect("resave");
    let reloaded = Config::load_from_path(&config_path).expect("reload");
    assert!(!reloaded.ingress.enabled);
}

#[test]
fn duplicate_priorities_are_collapsed() {
    let mut config = Config::default();
    config.connection.priority = vec![
        TransportId::Relay,
        TransportId::Local,
        TransportId::Relay,
    ];
    assert_eq!(
        config.transport_order(),
        vec![TransportId::Relay, TransportId::Local]
    );
}

#[test]
fn invalid_toml_reports_parse_error_with_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "[connection\npriority = 3").expect("write config");

    let err = Config::load_from_path(&config_path).expect_err("should fail");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("config.toml"));
}

#[test]
fn unknown_transport_in_priority_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "[connection]\npriority = [\"carrier-pigeon\"]\n")
        .expect("write config");

    assert!(matches!(
        Config::load_from_path(&config_path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn resolve_path_prefers_override() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let explicit = temp_dir.path().join("custom.toml");
    assert_eq!(
        Config::resolve_path(Some(&explicit)).expect("resolve"),
        explicit
    );
}

#[test]
fn ingress_target_uses_protocol_host_and_port() {
    let config = Config::default();
    assert_eq!(config.ingress.target(), "http://localhost:11434");
}
