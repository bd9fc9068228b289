use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration, mapped from `tether.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub peer: PeerConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

// ── Peer ───────────────────────────────────────────────────────

/// Which side refuses an incoming offer while holding its own local offer.
///
/// Both ends must run the same rule so exactly one side refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlareRule {
    /// The peer whose identity sorts first refuses; the other answers.
    LowerIdRefuses,
    /// The peer whose identity sorts last refuses; the other answers.
    HigherIdRefuses,
}

impl GlareRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlareRule::LowerIdRefuses => "lower-id-refuses",
            GlareRule::HigherIdRefuses => "higher-id-refuses",
        }
    }
}

impl fmt::Display for GlareRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GlareRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower-id-refuses" => Ok(GlareRule::LowerIdRefuses),
            "higher-id-refuses" => Ok(GlareRule::HigherIdRefuses),
            other => Err(format!(
                "unknown glare rule '{other}' (expected lower-id-refuses or higher-id-refuses)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Seconds a connection may stay without ever reaching "connected"
    /// before it is removed.
    pub idle_timeout_secs: u64,
    /// Glare resolution rule shared by every peer of the mesh.
    pub glare_rule: GlareRule,
    /// Announce known identities when the identity channel opens (mesh discovery).
    pub announce_peers: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            glare_rule: GlareRule::LowerIdRefuses,
            announce_peers: true,
        }
    }
}

impl PeerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Session ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Parameters handed to the transport when a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN servers for the transport's ICE engine.
    pub ice_servers: Vec<IceServer>,
    /// Upper bound for waiting on ICE gathering. 0 = wait forever.
    pub ice_gather_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun.cloudflare.com:3478"),
            ],
            ice_gather_timeout_secs: 15,
        }
    }
}

impl SessionConfig {
    pub fn ice_gather_timeout(&self) -> Option<Duration> {
        (self.ice_gather_timeout_secs > 0).then(|| Duration::from_secs(self.ice_gather_timeout_secs))
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl TetherConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Idle timeout ───
        if self.peer.idle_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "peer.idle_timeout_secs".into(),
                message: "idle timeout is 0, every connection would be dropped immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 60".into()),
            });
        } else if self.peer.idle_timeout_secs > 300 {
            warnings.push(ConfigWarning {
                field: "peer.idle_timeout_secs".into(),
                message: format!(
                    "idle timeout is {}s, abandoned handshakes will linger",
                    self.peer.idle_timeout_secs
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Values between 60 and 300 seconds are typical".into()),
            });
        }

        // ── ICE servers ───
        if self.session.ice_servers.is_empty() {
            warnings.push(ConfigWarning {
                field: "session.ice_servers".into(),
                message: "no ICE servers, only host candidates will be gathered".into(),
                severity: WarningSeverity::Info,
                hint: Some("Add e.g. 'stun:stun.l.google.com:19302' to reach peers behind NAT".into()),
            });
        }
        for (i, server) in self.session.ice_servers.iter().enumerate() {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                warnings.push(ConfigWarning {
                    field: format!("session.ice_servers[{i}].urls"),
                    message: "ICE server has an empty URL".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
                continue;
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"];
                if !known.iter().any(|p| url.starts_with(p)) {
                    warnings.push(ConfigWarning {
                        field: format!("session.ice_servers[{i}].urls"),
                        message: format!("'{url}' is not a stun:/turn: URL"),
                        severity: WarningSeverity::Warning,
                        hint: None,
                    });
                }
                if url.starts_with("turn") && server.credential.is_empty() {
                    warnings.push(ConfigWarning {
                        field: format!("session.ice_servers[{i}].credential"),
                        message: format!("TURN server '{url}' has no credential"),
                        severity: WarningSeverity::Warning,
                        hint: Some("Most TURN servers reject unauthenticated allocations".into()),
                    });
                }
            }
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
