use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "drawsync/0.1";
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_MAX_FETCH_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DrawsyncConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub extract: ExtractSection,
    #[serde(default)]
    pub parser: ParserSection,
    #[serde(default)]
    pub render: RenderSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteSection {
    pub url: Option<String>,
    /// Explicit target spaces; empty means every space the remote lists.
    pub spaces: Vec<String>,
    pub skip_personal_spaces: bool,
    pub page_size: usize,
    pub rate_limit_per_second: u32,
    pub timeout_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            url: None,
            spaces: Vec::new(),
            skip_personal_spaces: true,
            page_size: DEFAULT_PAGE_SIZE,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractSection {
    pub batch_size: usize,
    pub workers: usize,
    pub max_fetch_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ExtractSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            max_fetch_retries: DEFAULT_MAX_FETCH_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
pub enum ParserKind {
    #[default]
    #[serde(rename = "quick-xml")]
    QuickXml,
}

impl ParserKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuickXml => "quick-xml",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ParserSection {
    pub kind: ParserKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RenderSection {
    /// Export command; previews are disabled when unset.
    pub command: Option<String>,
    /// Arguments with `{input}` / `{output}` placeholders.
    pub args: Vec<String>,
}

impl DrawsyncConfig {
    /// Applies process env overrides on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(url) = lookup("CONFLUENCE_URL") {
            self.remote.url = Some(url);
        }
        if let Some(spaces) = lookup("DRAWSYNC_SPACES") {
            self.remote.spaces = parse_space_list(&spaces);
        }
        if let Some(agent) = lookup("DRAWSYNC_USER_AGENT") {
            self.remote.user_agent = Some(agent);
        }
        if let Some(value) = lookup("DRAWSYNC_RATE_LIMIT").and_then(|v| v.parse().ok()) {
            self.remote.rate_limit_per_second = value;
        }
        if let Some(value) = lookup("DRAWSYNC_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.remote.page_size = value;
        }
        if let Some(value) = lookup("DRAWSYNC_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.remote.timeout_ms = value;
        }
        if let Some(value) = lookup("DRAWSYNC_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.extract.batch_size = value;
        }
        if let Some(value) = lookup("DRAWSYNC_WORKERS").and_then(|v| v.parse().ok()) {
            self.extract.workers = value;
        }
        if let Some(command) = lookup("DRAWSYNC_RENDER_COMMAND") {
            self.render.command = Some(command);
        }
        self
    }

    /// Resolve user agent: config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.remote
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

/// Splits a comma/whitespace separated space list, dropping blanks and duplicates.
pub fn parse_space_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in raw.split([',', ' ', '\t', '\n']) {
        let key = part.trim();
        if !key.is_empty() && !out.iter().any(|existing| existing == key) {
            out.push(key.to_string());
        }
    }
    out
}

/// Load and parse a DrawsyncConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DrawsyncConfig> {
    if !config_path.exists() {
        return Ok(DrawsyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DrawsyncConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct RemoteConfigPatch {
    pub set_url: Option<String>,
    pub set_spaces: Option<Vec<String>>,
}

/// Update selected keys under `[remote]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_remote_config(config_path: &Path, patch: &RemoteConfigPatch) -> Result<bool> {
    if patch.set_url.is_none() && patch.set_spaces.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let remote_entry = root_table
        .entry("remote".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let remote_table = remote_entry.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("[remote] must be a table in {}", config_path.display())
    })?;

    if let Some(url) = &patch.set_url {
        if url.trim().is_empty() {
            bail!("remote url cannot be empty");
        }
        remote_table.insert(
            "url".to_string(),
            Value::String(url.trim().trim_end_matches('/').to_string()),
        );
    }
    if let Some(spaces) = &patch.set_spaces {
        if spaces.is_empty() {
            remote_table.remove("spaces");
        } else {
            let array = spaces
                .iter()
                .map(|space| Value::String(space.clone()))
                .collect();
            remote_table.insert("spaces".to_string(), Value::Array(array));
        }
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_documented_limits() {
        let config = DrawsyncConfig::default();
        assert!(config.remote.url.is_none());
        assert!(config.remote.skip_personal_spaces);
        assert_eq!(config.remote.rate_limit_per_second, 5);
        assert_eq!(config.extract.batch_size, 50);
        assert_eq!(config.parser.kind, ParserKind::QuickXml);
        assert!(config.render.command.is_none());
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, DrawsyncConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[remote]
url = "https://confluence.example.org"
spaces = ["DEMO", "ARCH"]
rate_limit_per_second = 2

[extract]
batch_size = 10

[parser]
kind = "quick-xml"

[render]
command = "drawio"
args = ["--export", "{input}"]
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.remote.url.as_deref(),
            Some("https://confluence.example.org")
        );
        assert_eq!(config.remote.spaces, vec!["DEMO", "ARCH"]);
        assert_eq!(config.remote.rate_limit_per_second, 2);
        assert_eq!(config.remote.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.extract.batch_size, 10);
        assert_eq!(config.extract.workers, DEFAULT_WORKERS);
        assert_eq!(config.render.command.as_deref(), Some("drawio"));
    }

    #[test]
    fn load_config_rejects_unknown_parser() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[parser]\nkind = \"regex\"\n").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_take_precedence_over_file_values() {
        let env = HashMap::from([
            ("CONFLUENCE_URL".to_string(), " https://wiki.corp ".to_string()),
            ("DRAWSYNC_SPACES".to_string(), "DEMO, OPS,,DEMO".to_string()),
            ("DRAWSYNC_BATCH_SIZE".to_string(), "7".to_string()),
            ("DRAWSYNC_WORKERS".to_string(), "not-a-number".to_string()),
        ]);
        let mut config = DrawsyncConfig::default();
        config.remote.url = Some("https://from-file".to_string());
        let config = config.with_overrides_from(|key| env.get(key).cloned());

        assert_eq!(config.remote.url.as_deref(), Some("https://wiki.corp"));
        assert_eq!(config.remote.spaces, vec!["DEMO", "OPS"]);
        assert_eq!(config.extract.batch_size, 7);
        assert_eq!(config.extract.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn patch_remote_config_preserves_other_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[extract]\nbatch_size = 9\n").expect("write config");

        let wrote = patch_remote_config(
            &config_path,
            &RemoteConfigPatch {
                set_url: Some("https://confluence.example.org/".to_string()),
                set_spaces: Some(vec!["DEMO".to_string()]),
            },
        )
        .expect("patch");
        assert!(wrote);

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.remote.url.as_deref(),
            Some("https://confluence.example.org")
        );
        assert_eq!(config.remote.spaces, vec!["DEMO"]);
        assert_eq!(config.extract.batch_size, 9);

        let again = patch_remote_config(
            &config_path,
            &RemoteConfigPatch {
                set_url: Some("https://confluence.example.org".to_string()),
                set_spaces: None,
            },
        )
        .expect("patch again");
        assert!(!again);
    }
}
