//! Configuration loading for the Trellis gateway.
//!
//! Two sources feed the process environment, with priority
//! **existing env > project `.env` > XDG `config.toml`**: a key already set
//! in the environment is never overwritten. Typed gateway settings are then
//! read from the environment by [`GatewaySettings::from_env`].

mod dotenv;
mod xdg_toml;

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads `.env` (current directory or `override_dir`) and
/// `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]`, then sets environment
/// variables for keys that are not already set.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        if let Some(value) = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)) {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

/// Gateway knobs read from `TRELLIS_*` environment variables, with the
/// defaults used when a variable is absent or unparseable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Agent addressed when a message names none (`TRELLIS_DEFAULT_AGENT`).
    pub default_agent: String,
    /// Per-session collision policy (`TRELLIS_QUEUE_MODE`):
    /// `queue` | `followup` | `interrupt`.
    pub queue_mode: String,
    /// Lane sizes (`TRELLIS_LANE_MAIN` etc.).
    pub lane_main: usize,
    pub lane_subagent: usize,
    pub lane_delegate: usize,
    pub lane_cron: usize,
    /// WebSocket bind address (`TRELLIS_BIND`).
    pub bind: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_agent: "main".into(),
            queue_mode: "queue".into(),
            lane_main: 4,
            lane_subagent: 8,
            lane_delegate: 4,
            lane_cron: 2,
            bind: "127.0.0.1:7171".into(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl GatewaySettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_agent: env_or("TRELLIS_DEFAULT_AGENT", defaults.default_agent),
            queue_mode: env_or("TRELLIS_QUEUE_MODE", defaults.queue_mode),
            lane_main: env_or("TRELLIS_LANE_MAIN", defaults.lane_main),
            lane_subagent: env_or("TRELLIS_LANE_SUBAGENT", defaults.lane_subagent),
            lane_delegate: env_or("TRELLIS_LANE_DELEGATE", defaults.lane_delegate),
            lane_cron: env_or("TRELLIS_LANE_CRON", defaults.lane_cron),
            bind: env_or("TRELLIS_BIND", defaults.bind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_env_wins_over_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "TRELLIS_TEST_PRIORITY=from_dotenv\n").unwrap();
        std::env::set_var("TRELLIS_TEST_PRIORITY", "from_env");

        load_and_apply("trellis-test-nonexistent", Some(dir.path())).unwrap();
        assert_eq!(
            std::env::var("TRELLIS_TEST_PRIORITY").unwrap(),
            "from_env"
        );
        std::env::remove_var("TRELLIS_TEST_PRIORITY");
    }

    #[test]
    fn dotenv_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "TRELLIS_TEST_FILL=filled\n").unwrap();
        std::env::remove_var("TRELLIS_TEST_FILL");

        load_and_apply("trellis-test-nonexistent", Some(dir.path())).unwrap();
        assert_eq!(std::env::var("TRELLIS_TEST_FILL").unwrap(), "filled");
        std::env::remove_var("TRELLIS_TEST_FILL");
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        std::env::remove_var("TRELLIS_DEFAULT_AGENT");
        let settings = GatewaySettings::from_env();
        assert_eq!(settings.default_agent, "main");
        assert_eq!(settings.lane_subagent, 8);
    }

    #[test]
    fn settings_read_env_overrides() {
        std::env::set_var("TRELLIS_LANE_MAIN", "9");
        let settings = GatewaySettings::from_env();
        assert_eq!(settings.lane_main, 9);
        std::env::remove_var("TRELLIS_LANE_MAIN");
    }
}
