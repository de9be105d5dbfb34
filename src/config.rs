//! Ambient configuration layer. The wire protocol and child table need no
//! configuration at all; this exists for the knobs an operator reasonably
//! wants to tune without recompiling, loaded with the usual `toml`+`serde`
//! pairing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_max_reported_children() -> i32 {
    crate::message::MAX_REPORTED_CHILDREN
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on `num_children` reported in a handshake response.
    pub max_reported_children: i32,
    /// `tracing` filter directive, e.g. "info" or "multipty=debug".
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reported_children: default_max_reported_children(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `multipty.toml` next to the socket if present, otherwise fall
    /// back to defaults. A missing config file is not an error; a malformed
    /// one is.
    pub fn load_near(socket_path: &Path) -> Result<Self> {
        let config_path = config_path_for(socket_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", config_path.display()))
    }
}

fn config_path_for(socket_path: &Path) -> PathBuf {
    socket_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("multipty.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_present() {
        let cfg = Config::load_near(Path::new("/tmp/does-not-exist-multipty/sock")).unwrap();
        assert_eq!(cfg.max_reported_children, crate::message::MAX_REPORTED_CHILDREN);
        assert_eq!(cfg.log_level, "info");
    }
}
