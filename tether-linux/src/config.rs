//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use tether_core::CoreConfig;

/// How the bridge decides a notification went out before releasing the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Wait for the link's per-frame ack.
    Ack,
    /// Fixed delay between frames on a channel.
    Delay,
}

impl std::str::FromStr for Pacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack" => Ok(Pacing::Ack),
            "delay" => Ok(Pacing::Delay),
            other => Err(format!("unknown pacing {other:?}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_LISTEN_PORT, TETHER_CATALOG, TETHER_PACING, TETHER_FRAME_INTERVAL_MS,
/// TETHER_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Link bridge TCP port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Catalog JSON file. Empty catalog when unset.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default = "default_pacing")]
    pub pacing: Pacing,
    /// Gap between frames on one channel when pacing is `delay`.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_artwork_entries")]
    pub artwork_cache_entries: usize,
    #[serde(default = "default_lyrics_entries")]
    pub lyrics_cache_entries: usize,
    /// Sent with every time sync.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// tracing-subscriber filter directive. RUST_LOG wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_listen_port() -> u16 {
    45680
}
fn default_pacing() -> Pacing {
    Pacing::Ack
}
fn default_frame_interval_ms() -> u64 {
    15
}
fn default_artwork_entries() -> usize {
    tether_core::cache::DEFAULT_ARTWORK_ENTRIES
}
fn default_lyrics_entries() -> usize {
    tether_core::cache::DEFAULT_LYRICS_ENTRIES
}
fn default_fetch_timeout_secs() -> u64 {
    10
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            catalog_path: None,
            pacing: default_pacing(),
            frame_interval_ms: default_frame_interval_ms(),
            artwork_cache_entries: default_artwork_entries(),
            lyrics_cache_entries: default_lyrics_entries(),
            utc_offset_minutes: 0,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            artwork_cache_entries: self.artwork_cache_entries,
            lyrics_cache_entries: self.lyrics_cache_entries,
            ..CoreConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("TETHER_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(path) = var("TETHER_CATALOG").filter(|s| !s.is_empty()) {
        c.catalog_path = Some(PathBuf::from(path));
    }
    if let Some(p) = var("TETHER_PACING").and_then(|s| s.parse::<Pacing>().ok()) {
        c.pacing = p;
    }
    if let Some(ms) = var("TETHER_FRAME_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.frame_interval_ms = ms;
    }
    if let Some(filter) = var("TETHER_LOG").filter(|s| !s.is_empty()) {
        c.log_filter = filter;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

/// First existing file wins; a file that fails to parse falls back to defaults.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    parse_file(path)
}

fn parse_file(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            // Logging is not up yet; the filter itself comes from this file.
            eprintln!("tether: ignoring {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_port, 45680);
        assert_eq!(c.pacing, Pacing::Ack);
        assert_eq!(c.frame_interval_ms, 15);
        assert_eq!(c.artwork_cache_entries, 16);
        assert_eq!(c.lyrics_cache_entries, 32);
        assert_eq!(c.log_filter, "info");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 5000
            pacing = "delay"
            catalog_path = "/var/lib/tether/catalog.json"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.pacing, Pacing::Delay);
        assert_eq!(
            c.catalog_path.as_deref(),
            Some(Path::new("/var/lib/tether/catalog.json"))
        );
        assert_eq!(c.fetch_timeout_secs, 10);
        assert_eq!(c.core_config().lyrics_cache_entries, 32);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("TETHER_LISTEN_PORT", "6000"),
            ("TETHER_PACING", "DELAY"),
            ("TETHER_FRAME_INTERVAL_MS", "not-a-number"),
            ("TETHER_LOG", "tether_core=debug"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.pacing, Pacing::Delay);
        assert_eq!(c.frame_interval_ms, 15);
        assert_eq!(c.log_filter, "tether_core=debug");
        assert!(c.catalog_path.is_none());
    }

    #[test]
    fn missing_files_give_none() {
        assert!(load_file(&[PathBuf::from("/nonexistent/tether/config.toml")]).is_none());
    }
}
