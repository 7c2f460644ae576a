//! Integration tests for configuration parsing
//!
//! Covers the daemon and consumer configuration files:
//! - Minimal and full daemon configs
//! - Filter and duration validation
//! - Load/save through real files

use std::time::Duration;

mod server_config {
    use super::*;
    use server::config::{ServerConfig, load_config};
    use server::test_utils::raw_device;
    use server::usb::DupStrategyKind;

    const MINIMAL_SERVER_CONFIG: &str = r#"
[server]
log_level = "info"
"#;

    const FULL_SERVER_CONFIG: &str = r#"
[server]
socket_path = "/run/usb-fd-bridge/bridge.sock"
service_mode = true
log_level = "debug"

[usb]
filters = ["0x1209:*", "0x2341:0x0043"]
cdc_acm_only = true
skip_root_hubs = false

[handoff]
dup_strategy = "legacy"
open_timeout = "1m30s"
"#;

    #[test]
    fn test_parse_minimal_server_config() {
        let config = ServerConfig::from_toml(MINIMAL_SERVER_CONFIG).unwrap();

        assert!(!config.server.service_mode);
        assert!(config.server.socket_path.ends_with("usb-fd-bridge.sock"));
        assert!(config.usb.filters.is_empty());
        assert!(config.usb.skip_root_hubs);
        assert!(!config.usb.cdc_acm_only);
        assert_eq!(config.handoff.dup_strategy, DupStrategyKind::Auto);
        assert_eq!(config.handoff.open_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_full_server_config() {
        let config = ServerConfig::from_toml(FULL_SERVER_CONFIG).unwrap();

        assert_eq!(
            config.server.socket_path().to_str().unwrap(),
            "/run/usb-fd-bridge/bridge.sock"
        );
        assert!(config.server.service_mode);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.usb.filters.len(), 2);
        assert_eq!(config.handoff.dup_strategy, DupStrategyKind::Legacy);
        assert_eq!(config.handoff.open_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_filter_from_config() {
        let config = ServerConfig::from_toml(FULL_SERVER_CONFIG).unwrap();
        let filter = config.usb.device_filter().unwrap();

        // Test devices use pid.codes VID 0x1209
        assert!(filter.allows(&raw_device(1, 5, Some("1-1"))));

        let mut other_vendor = raw_device(1, 6, Some("1-2"));
        other_vendor.vendor_id = 0x0403;
        assert!(!filter.allows(&other_vendor));

        let mut not_serial = raw_device(1, 7, Some("1-3"));
        not_serial.cdc_acm = false;
        assert!(!filter.allows(&not_serial));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = r#"
[server]
log_level = "verbose"
"#;
        assert!(ServerConfig::from_toml(config).is_err());
    }

    #[test]
    fn test_invalid_filters_rejected() {
        for filter in ["1209:0001", "0x12345:*", "0xZZZZ:*", "0x1209", ""] {
            let config = format!("[server]\n\n[usb]\nfilters = [\"{}\"]\n", filter);
            assert!(
                ServerConfig::from_toml(&config).is_err(),
                "filter {:?} should be rejected",
                filter
            );
        }
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        for timeout in ["0", "0s", "ten", "5x"] {
            let config = format!("[server]\n\n[handoff]\nopen_timeout = \"{}\"\n", timeout);
            assert!(
                ServerConfig::from_toml(&config).is_err(),
                "timeout {:?} should be rejected",
                timeout
            );
        }
    }

    #[test]
    fn test_unknown_dup_strategy_rejected() {
        let config = "[server]\n\n[handoff]\ndup_strategy = \"magic\"\n";
        assert!(ServerConfig::from_toml(config).is_err());
    }

    #[test]
    fn test_missing_server_section() {
        assert!(ServerConfig::from_toml("[usb]\nfilters = []\n").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");

        let mut config = ServerConfig::from_toml(FULL_SERVER_CONFIG).unwrap();
        config.handoff.open_timeout = Duration::from_millis(2500);
        config.save(&path).unwrap();

        let loaded = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.server.socket_path, config.server.socket_path);
        assert_eq!(loaded.usb.filters, config.usb.filters);
        assert_eq!(loaded.handoff.open_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(ServerConfig::load(Some(path)).is_err());
    }
}

mod client_config {
    use super::*;
    use client::config::ClientConfig;

    #[test]
    fn test_parse_full_client_config() {
        let config: ClientConfig = toml::from_str(
            r#"
[client]
socket_path = "~/bridge.sock"
log_level = "debug"
request_timeout_secs = 5
"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert!(!config.client.socket_path().starts_with("~"));
        assert_eq!(config.client.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");

        let mut config = ClientConfig::default();
        config.client.request_timeout_secs = 3;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.request_timeout_secs, 3);
        assert_eq!(loaded.client.socket_path, config.client.socket_path);
    }

    #[test]
    fn test_invalid_client_config_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[client]\nrequest_timeout_secs = 0\n").unwrap();

        assert!(ClientConfig::load(Some(path)).is_err());
    }
}
