//! Daemon configuration — §6 "Persisted file formats" / SPEC_FULL §2
//! Ambient stack.
//!
//! `~/.archon/config.toml` is parsed once at startup into an immutable
//! [`DaemonConfig`] and threaded into every factory and store. Per the
//! "Global state" design note, nothing here is re-read lazily — there is no
//! hot-reload watcher.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4300;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderToml {
    pub command: Option<String>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonToml {
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultsToml {
    pub model: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    daemon: DaemonToml,
    #[serde(default)]
    defaults: DefaultsToml,
    #[serde(default)]
    providers: HashMap<String, ProviderToml>,
}

fn load_toml(path: &Path) -> TomlConfig {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return TomlConfig::default();
    };
    match toml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            TomlConfig::default()
        }
    }
}

// ─── Resolved provider profile ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ProviderProfile {
    pub command: Option<String>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub default_model: Option<String>,
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub providers: HashMap<String, ProviderProfile>,
}

/// CLI-level overrides. `None` means "fall through to env/TOML/default".
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
}

impl DaemonConfig {
    /// Load config.toml and layer CLI > env > TOML > built-in default.
    pub fn load(args: ConfigArgs) -> Self {
        let data_dir = args
            .data_dir
            .or_else(|| std::env::var_os("ARCHON_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let toml = load_toml(&config_path(&data_dir));

        let port = args
            .port
            .or_else(|| std::env::var("ARCHON_PORT").ok().and_then(|s| s.parse().ok()))
            .or_else(|| {
                toml.daemon
                    .address
                    .as_deref()
                    .and_then(|addr| addr.rsplit_once(':'))
                    .and_then(|(_, p)| p.parse().ok())
            })
            .unwrap_or(DEFAULT_PORT);

        let log = args
            .log
            .or_else(|| std::env::var("ARCHON_LOG").ok())
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());

        let mut providers: HashMap<String, ProviderProfile> = HashMap::new();
        for (name, p) in toml.providers {
            let token = p.token.clone().or_else(|| {
                p.token_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            });
            providers.insert(
                name,
                ProviderProfile {
                    command: p.command,
                    base_url: p.base_url,
                    token,
                    timeout_seconds: p.timeout_seconds,
                    default_model: None,
                },
            );
        }
        if let Some(models) = toml.defaults.model {
            for (provider, model) in models {
                providers.entry(provider).or_default().default_model = Some(model);
            }
        }

        // Per-provider subprocess command overrides named in §6 env vars.
        for (env_var, provider) in [
            ("ARCHON_CODEX_CMD", "codex"),
            ("ARCHON_CLAUDE_CMD", "claude"),
            ("ARCHON_OPENCODE_CMD", "opencode"),
        ] {
            if let Ok(cmd) = std::env::var(env_var) {
                providers.entry(provider.to_string()).or_default().command = Some(cmd);
            }
        }
        for (env_var, provider) in [("OPENCODE_BASE_URL", "opencode"), ("KILOCODE_BASE_URL", "kilocode")] {
            if let Ok(url) = std::env::var(env_var) {
                providers.entry(provider.to_string()).or_default().base_url = Some(url);
            }
        }
        for (env_var, provider) in [
            ("OPENCODE_TOKEN", "opencode"),
            ("OPENCODE_SERVER_PASSWORD", "opencode"),
            ("KILOCODE_TOKEN", "kilocode"),
            ("KILOCODE_SERVER_PASSWORD", "kilocode"),
        ] {
            if let Ok(tok) = std::env::var(env_var) {
                providers.entry(provider.to_string()).or_default().token = Some(tok);
            }
        }

        Self {
            port,
            data_dir,
            log,
            providers,
        }
    }

    pub fn provider_profile(&self, name: &str) -> ProviderProfile {
        self.providers.get(name).cloned().unwrap_or_default()
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    // Config lives at ~/.archon/config.toml per spec.md §6, irrespective of
    // where per-process state (`data_dir`) is rooted.
    home_archon_dir().unwrap_or_else(|| data_dir.to_path_buf()).join("config.toml")
}

pub fn home_archon_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".archon"))
}

/// Write a starter config.toml with commented-out example sections.
pub fn write_starter_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_CONFIG)
}

const STARTER_CONFIG: &str = r#"# archon daemon configuration

[daemon]
address = "127.0.0.1:4300"

[defaults]
# model = { claude = "claude-opus-4", codex = "gpt-5" }

# [providers.claude]
# command = "claude"

# [providers.codex]
# command = "codex"

# [providers.opencode]
# base_url = "http://127.0.0.1:4096"
# token_env = "OPENCODE_TOKEN"
# timeout_seconds = 30
"#;

fn default_data_dir() -> PathBuf {
    if let Some(dir) = home_archon_dir() {
        return dir;
    }
    PathBuf::from(".archon")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_config_parses() {
        let cfg: TomlConfig = toml::from_str(STARTER_CONFIG).unwrap();
        assert_eq!(cfg.daemon.address.as_deref(), Some("127.0.0.1:4300"));
    }
}
