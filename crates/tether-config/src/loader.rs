use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::{IceServer, TetherConfig};

/// Keeps a hot-reload going while alive.
pub type ConfigWatcher = notify::RecommendedWatcher;

/// Loads and optionally hot-reloads the Tether configuration.
#[derive(Debug)]
pub struct ConfigLoader {
    config: Arc<RwLock<TetherConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > TETHER_CONFIG env > ~/.tether/tether.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("TETHER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tether")
            .join("tether.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> tether_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            TetherConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(tether_core::TetherError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: TetherConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        }
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> TetherConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<TetherConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn read_file(path: &Path) -> tether_core::Result<TetherConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<TetherConfig>(&raw).map_err(|e| {
            tether_core::TetherError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply env var overrides (TETHER_IDLE_TIMEOUT_SECS, TETHER_GLARE_RULE, etc.)
    fn apply_env_overrides(mut config: TetherConfig) -> TetherConfig {
        if let Ok(v) = std::env::var("TETHER_IDLE_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => config.peer.idle_timeout_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric TETHER_IDLE_TIMEOUT_SECS"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_GLARE_RULE") {
            match v.parse() {
                Ok(rule) => config.peer.glare_rule = rule,
                Err(e) => warn!(error = %e, "ignoring TETHER_GLARE_RULE"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("TETHER_ICE_SERVERS") {
            config.session.ice_servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServer::stun)
                .collect();
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> tether_core::Result<()> {
        if !self.config_path.exists() {
            return Err(tether_core::TetherError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read_file(&self.config_path)?);
        new_config
            .validate()
            .map_err(tether_core::TetherError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that swaps in the new config when the file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> tether_core::Result<ConfigWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    match ConfigLoader::read_file(&path_for_event) {
                        Ok(new_config) => {
                            let new_config = ConfigLoader::apply_env_overrides(new_config);
                            if let Err(e) = new_config.validate() {
                                warn!(error = %e, "config file has errors, keeping current config");
                                return;
                            }
                            *config.write() = new_config;
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            })
            .map_err(|e| {
                tether_core::TetherError::Config(format!("failed to create file watcher: {}", e))
            })?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                tether_core::TetherError::Config(format!("failed to watch config directory: {}", e))
            })?;

        Ok(watcher)
    }
}
