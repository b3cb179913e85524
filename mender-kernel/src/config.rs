use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Override { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: ListenConf,
    pub liveness: LivenessConf,
    /// `None` keeps reports local (admin API only).
    pub health_sink: Option<SinkConf>,
    pub failure_log: PathBuf,
    pub remediation: RemediationConf,
    pub admin: AdminConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListenConf {
    pub identity: SocketAddr,
    pub heartbeat: SocketAddr,
    pub stream: SocketAddr,
    pub admin: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConf {
    pub timeout_secs: u64,
    pub publish_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConf {
    pub uri: String, // ex: "ws://localhost:9001"
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemediationConf {
    /// Directory holding the workers' source files (and their backups).
    pub source_dir: PathBuf,
    /// Extensions tried when the app name is not itself a file name.
    pub source_extensions: Vec<String>,
    pub fixer: FixerConf,
    /// Failure-log entries of the app handed to the fixer.
    pub context_entries: usize,
    pub knowledge_base: Option<PathBuf>,
    pub history_limit: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FixerConf {
    pub command: Option<String>, // ex: "python3 fixer.py --model gemini-2.5-flash"
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AdminConf {
    pub api_key: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: ListenConf::default(),
            liveness: LivenessConf::default(),
            health_sink: Some(SinkConf::default()),
            failure_log: PathBuf::from("log.txt"),
            remediation: RemediationConf::default(),
            admin: AdminConf::default(),
        }
    }
}

impl Default for ListenConf {
    fn default() -> Self {
        Self {
            identity: SocketAddr::from(([0, 0, 0, 0], 8765)),
            heartbeat: SocketAddr::from(([0, 0, 0, 0], 8766)),
            stream: SocketAddr::from(([0, 0, 0, 0], 8767)),
            admin: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { timeout_secs: 5, publish_interval_ms: 1000 }
    }
}

impl Default for SinkConf {
    fn default() -> Self {
        Self { uri: "ws://localhost:9001".into(), timeout_secs: 2 }
    }
}

impl Default for RemediationConf {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            source_extensions: vec!["py".into()],
            fixer: FixerConf::default(),
            context_entries: 20,
            knowledge_base: Some(PathBuf::from("knowledge_base.json")),
            history_limit: 32,
        }
    }
}

impl Default for FixerConf {
    fn default() -> Self {
        Self { command: None, timeout_secs: 120 }
    }
}

impl KernelConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness.timeout_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.liveness.publish_interval_ms)
    }

    pub fn fixer_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation.fixer.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness.timeout_secs == 0 {
            return Err(ConfigError::Invalid("liveness.timeout_secs must be > 0".into()));
        }
        if self.liveness.publish_interval_ms == 0 {
            return Err(ConfigError::Invalid("liveness.publish_interval_ms must be > 0".into()));
        }
        if self.remediation.fixer.timeout_secs == 0 {
            return Err(ConfigError::Invalid("remediation.fixer.timeout_secs must be > 0".into()));
        }
        if let Some(sink) = &self.health_sink {
            if !(sink.uri.starts_with("ws://") || sink.uri.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!("health_sink.uri must be a ws:// or wss:// URI, got {}", sink.uri)));
            }
        }
        Ok(())
    }

    /// Applies `MENDER_*` environment overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn addr(key: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
            value.parse().map_err(|_| ConfigError::Override { key, value })
        }

        if let Some(v) = lookup("MENDER_IDENTITY_ADDR") {
            self.listen.identity = addr("MENDER_IDENTITY_ADDR", v)?;
        }
        if let Some(v) = lookup("MENDER_HEARTBEAT_ADDR") {
            self.listen.heartbeat = addr("MENDER_HEARTBEAT_ADDR", v)?;
        }
        if let Some(v) = lookup("MENDER_STREAM_ADDR") {
            self.listen.stream = addr("MENDER_STREAM_ADDR", v)?;
        }
        if let Some(v) = lookup("MENDER_ADMIN_ADDR") {
            self.listen.admin = addr("MENDER_ADMIN_ADDR", v)?;
        }
        if let Some(v) = lookup("MENDER_HEALTH_SINK") {
            if v.trim().is_empty() || v == "none" {
                self.health_sink = None;
            } else {
                let timeout_secs = self.health_sink.as_ref().map_or(2, |s| s.timeout_secs);
                self.health_sink = Some(SinkConf { uri: v, timeout_secs });
            }
        }
        if let Some(v) = lookup("MENDER_LIVENESS_TIMEOUT") {
            self.liveness.timeout_secs = v
                .parse()
                .map_err(|_| ConfigError::Override { key: "MENDER_LIVENESS_TIMEOUT", value: v })?;
        }
        if let Some(v) = lookup("MENDER_FIXER_COMMAND") {
            self.remediation.fixer.command = Some(v);
        }
        if let Some(v) = lookup("MENDER_SOURCE_DIR") {
            self.remediation.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MENDER_API_KEY") {
            self.admin.api_key = Some(v);
        }
        Ok(())
    }
}

/// Parses a YAML document; an empty document means defaults.
pub fn parse_config(txt: &str, path: &Path) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt).map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })
}

/// Loads `$MENDER_CONFIG` (or `mender.yaml`), then environment overrides.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = PathBuf::from(std::env::var("MENDER_CONFIG").unwrap_or_else(|_| "mender.yaml".into()));
    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        info!(path = %path.display(), "loaded configuration");
        parse_config(&txt, &path)?
    } else {
        warn!(path = %path.display(), "no configuration file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = KernelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.publish_interval(), Duration::from_secs(1));
        assert_eq!(cfg.fixer_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.remediation.source_extensions, vec!["py".to_string()]);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "liveness:\n  timeout_secs: 10\nremediation:\n  source_dir: /srv/workers\n";
        let cfg = parse_config(yaml, Path::new("mender.yaml")).unwrap();
        assert_eq!(cfg.liveness.timeout_secs, 10);
        assert_eq!(cfg.liveness.publish_interval_ms, 1000);
        assert_eq!(cfg.remediation.source_dir, PathBuf::from("/srv/workers"));
        assert_eq!(cfg.remediation.fixer.timeout_secs, 120);
        assert_eq!(cfg.listen.admin.port(), 8080);
    }

    #[test]
    fn test_empty_yaml_is_default_and_garbage_is_error() {
        let cfg = parse_config("  \n", Path::new("x.yaml")).unwrap();
        assert_eq!(cfg.liveness.timeout_secs, 5);
        assert!(matches!(
            parse_config("liveness: [1, 2", Path::new("x.yaml")),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MENDER_STREAM_ADDR", "127.0.0.1:9999"),
            ("MENDER_HEALTH_SINK", "none"),
            ("MENDER_LIVENESS_TIMEOUT", "7"),
            ("MENDER_FIXER_COMMAND", "python3 fixer.py"),
        ]);
        let mut cfg = KernelConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.listen.stream.port(), 9999);
        assert!(cfg.health_sink.is_none());
        assert_eq!(cfg.liveness.timeout_secs, 7);
        assert_eq!(cfg.remediation.fixer.command.as_deref(), Some("python3 fixer.py"));

        let mut cfg = KernelConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "MENDER_ADMIN_ADDR").then(|| "not-an-addr".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { key: "MENDER_ADMIN_ADDR", .. }));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_bad_sink() {
        let mut cfg = KernelConfig::default();
        cfg.liveness.timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = KernelConfig::default();
        cfg.health_sink = Some(SinkConf { uri: "http://x".into(), timeout_secs: 1 });
        assert!(cfg.validate().is_err());
    }
}
