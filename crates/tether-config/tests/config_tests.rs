#[cfg(test)]
mod tests {
    use tether_config::ConfigLoader;
    use tether_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_tether_config_defaults() {
        let config = TetherConfig::default();
        assert_eq!(config.peer.idle_timeout_secs, 60);
        assert_eq!(config.peer.glare_rule, GlareRule::LowerIdRefuses);
        assert!(config.peer.announce_peers);
        assert_eq!(config.session.ice_gather_timeout_secs, 15);
        assert_eq!(config.session.ice_servers.len(), 2);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_defaults_validate_cleanly() {
        let warnings = TetherConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn test_duration_helpers() {
        let mut config = TetherConfig::default();
        assert_eq!(config.peer.idle_timeout().as_secs(), 60);
        assert_eq!(config.session.ice_gather_timeout().unwrap().as_secs(), 15);
        config.session.ice_gather_timeout_secs = 0;
        assert!(config.session.ice_gather_timeout().is_none());
    }

    // ── Glare rule ─────────────────────────────────────────────

    #[test]
    fn test_glare_rule_parse() {
        assert_eq!(
            "higher-id-refuses".parse::<GlareRule>().unwrap(),
            GlareRule::HigherIdRefuses
        );
        assert!("coin-flip".parse::<GlareRule>().is_err());
        assert_eq!(GlareRule::LowerIdRefuses.to_string(), "lower-id-refuses");
    }

    #[test]
    fn test_unknown_glare_rule_in_toml_rejected() {
        let toml_str = r#"
[peer]
glare_rule = "whoever-is-faster"
"#;
        assert!(toml::from_str::<TetherConfig>(toml_str).is_err());
    }

    // ── TOML roundtrip tests ───────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = TetherConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: TetherConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.peer.idle_timeout_secs, config.peer.idle_timeout_secs);
        assert_eq!(restored.peer.glare_rule, config.peer.glare_rule);
        assert_eq!(restored.session.ice_servers, config.session.ice_servers);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[peer]
idle_timeout_secs = 120
"#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.peer.idle_timeout_secs, 120);
        // Defaults should fill in
        assert_eq!(config.peer.glare_rule, GlareRule::LowerIdRefuses);
        assert_eq!(config.logging.format, "pretty");
        assert!(!config.session.ice_servers.is_empty());
    }

    #[test]
    fn test_ice_server_deserialize() {
        let toml_str = r#"
[[session.ice_servers]]
urls = ["turn:turn.example.org:3478"]
username = "mesh"
credential = "secret"
"#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.ice_servers.len(), 1);
        assert_eq!(config.session.ice_servers[0].username, "mesh");
        assert!(config.validate().unwrap().is_empty());
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_zero_idle_timeout_is_error() {
        let mut config = TetherConfig::default();
        config.peer.idle_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("peer.idle_timeout_secs"));
    }

    #[test]
    fn test_long_idle_timeout_is_warning() {
        let mut config = TetherConfig::default();
        config.peer.idle_timeout_secs = 3600;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, WarningSeverity::Warning);
    }

    #[test]
    fn test_empty_ice_url_is_error() {
        let mut config = TetherConfig::default();
        config.session.ice_servers.push(IceServer::stun(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_turn_without_credential_warns() {
        let mut config = TetherConfig::default();
        config.session.ice_servers = vec![IceServer::stun("turn:relay.example.org")];
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field.ends_with("credential")));
    }

    #[test]
    fn test_no_ice_servers_is_info() {
        let mut config = TetherConfig::default();
        config.session.ice_servers.clear();
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, WarningSeverity::Info);
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let mut config = TetherConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert!(warnings[0].to_string().contains("logging.format"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[peer]
idle_timeout_secs = 90
glare_rule = "higher-id-refuses"

[logging]
format = "json"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.peer.idle_timeout_secs, 90);
        assert_eq!(config.peer.glare_rule, GlareRule::HigherIdRefuses);
        assert_eq!(config.logging.format, "json");
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");
        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");
        std::fs::write(&config_path, "[peer\n").unwrap();
        let err = ConfigLoader::load(Some(config_path.as_path())).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 30\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().peer.idle_timeout_secs, 30);

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 45\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().peer.idle_timeout_secs, 45);
    }

    #[test]
    fn test_config_loader_reload_keeps_config_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 30\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().peer.idle_timeout_secs, 30);
    }

    #[test]
    fn test_config_loader_watch_swaps_shared_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 30\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let shared = loader.shared();
        let _watcher = loader.watch().unwrap();

        std::fs::write(&config_path, "[peer]\nidle_timeout_secs = 75\n").unwrap();
        for _ in 0..100 {
            if shared.read().peer.idle_timeout_secs == 75 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert_eq!(shared.read().peer.idle_timeout_secs, 75);
    }

    #[test]
    fn test_from_config_snapshot() {
        let mut config = TetherConfig::default();
        config.peer.announce_peers = false;
        let loader = ConfigLoader::from_config(config);
        assert!(!loader.get().peer.announce_peers);
        loader.shared().write().peer.announce_peers = true;
        assert!(loader.get().peer.announce_peers);
    }
}
