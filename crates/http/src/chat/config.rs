use anyhow::Context;
use directories::BaseDirs;
use serde::Deserialize;
use std::{env, fs, path::PathBuf, time::Duration};
use tracing::warn;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub stream_idle_timeout_ms: Option<u64>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Whole-request limit, body included. Unset by default so long streams
    /// are bounded only by `stream_idle_timeout`.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Longest allowed gap between two body chunks.
    pub stream_idle_timeout: Option<Duration>,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Duration::from_millis(30_000),
            stream_idle_timeout: Some(Duration::from_millis(300_000)),
            proxy: None,
            user_agent: concat!("chatstream/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    /// Defaults, then `config.toml` if present, then environment.
    pub fn from_env_and_file() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                match fs::read_to_string(&path) {
                    Ok(text) => match toml::from_str::<TransportFileConfig>(&text) {
                        Ok(file_cfg) => cfg = cfg.merge_file(file_cfg),
                        Err(e) => {
                            warn!(target: "chatstream::config", "ignoring {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        warn!(target: "chatstream::config", "cannot read {}: {}", path.display(), e)
                    }
                }
            }
        }

        if let Some(ms) = env_millis("CHATSTREAM_TIMEOUT_MS")? {
            cfg.timeout = Some(ms);
        }
        if let Some(ms) = env_millis("CHATSTREAM_CONNECT_TIMEOUT_MS")? {
            cfg.connect_timeout = ms;
        }
        if let Some(ms) = env_millis("CHATSTREAM_STREAM_IDLE_TIMEOUT_MS")? {
            cfg.stream_idle_timeout = (!ms.is_zero()).then_some(ms);
        }
        if let Some(p) = env::var("HTTPS_PROXY")
            .ok()
            .or_else(|| env::var("HTTP_PROXY").ok())
        {
            cfg.proxy = Some(p);
        }

        Ok(cfg)
    }

    /// Overlays the keys present in `file`. A zero idle timeout disables it.
    pub fn merge_file(mut self, file: TransportFileConfig) -> Self {
        if let Some(t) = file.timeout_ms {
            self.timeout = Some(Duration::from_millis(t));
        }
        if let Some(t) = file.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(t);
        }
        if let Some(idle) = file.stream_idle_timeout_ms {
            self.stream_idle_timeout = (idle > 0).then(|| Duration::from_millis(idle));
        }
        if let Some(p) = file.proxy {
            self.proxy = Some(p);
        }
        if let Some(ua) = file.user_agent {
            self.user_agent = ua;
        }
        self
    }

    fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("chatstream").join("config.toml"))
    }
}

fn env_millis(key: &str) -> anyhow::Result<Option<Duration>> {
    match env::var(key) {
        Ok(v) => {
            let ms: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{key} must be milliseconds, got {v:?}"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}
