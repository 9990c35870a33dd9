use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::convert::DEFAULT_TOOLTIP_FORMAT;

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";
pub const DEFAULT_WORK_ITEM_ENDPOINT: &str = "_workitems/edit";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_WAIT_TIME_SECS: u64 = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BoardConfig {
    #[serde(default)]
    pub board: BoardSection,
    #[serde(default)]
    pub scrape: ScrapeSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BoardSection {
    /// Backlog URL the traversal starts from.
    pub base_url: Option<String>,
    /// Path segment under the project URL that opens one item by id.
    pub work_item_endpoint: Option<String>,
    pub webdriver_url: Option<String>,
    pub browser_binary: Option<String>,
    pub on_prem: Option<bool>,
    pub unparented: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ScrapeSection {
    pub max_retries: Option<u32>,
    pub max_wait_time_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub capture_changeset_content: Option<bool>,
    #[serde(default)]
    pub timestamp_formats: Vec<String>,
}

impl BoardConfig {
    /// Resolve the backlog URL: env BOARDPULL_BASE_URL > config > None.
    pub fn base_url_owned(&self) -> Option<String> {
        env_string("BOARDPULL_BASE_URL").or_else(|| self.board.base_url.clone())
    }

    pub fn work_item_endpoint(&self) -> String {
        env_string("BOARDPULL_WORK_ITEM_ENDPOINT")
            .or_else(|| self.board.work_item_endpoint.clone())
            .unwrap_or_else(|| DEFAULT_WORK_ITEM_ENDPOINT.to_string())
    }

    pub fn webdriver_url(&self) -> String {
        env_string("BOARDPULL_WEBDRIVER_URL")
            .or_else(|| self.board.webdriver_url.clone())
            .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string())
    }

    pub fn browser_binary(&self) -> Option<String> {
        env_string("BOARDPULL_BROWSER_BINARY").or_else(|| self.board.browser_binary.clone())
    }

    pub fn on_prem(&self) -> bool {
        env_bool("BOARDPULL_ON_PREM").or(self.board.on_prem).unwrap_or(false)
    }

    pub fn unparented(&self) -> bool {
        env_bool("BOARDPULL_UNPARENTED")
            .or(self.board.unparented)
            .unwrap_or(false)
    }

    pub fn max_retries(&self) -> u32 {
        env_parse("BOARDPULL_MAX_RETRIES")
            .or(self.scrape.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn max_wait_time(&self) -> Duration {
        let secs = env_parse("BOARDPULL_MAX_WAIT_TIME_SECS")
            .or(self.scrape.max_wait_time_secs)
            .unwrap_or(DEFAULT_MAX_WAIT_TIME_SECS);
        Duration::from_secs(secs)
    }

    pub fn poll_interval(&self) -> Duration {
        let millis = env_parse("BOARDPULL_POLL_INTERVAL_MS")
            .or(self.scrape.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        Duration::from_millis(millis)
    }

    pub fn retry_delay(&self) -> Duration {
        let millis = env_parse("BOARDPULL_RETRY_DELAY_MS")
            .or(self.scrape.retry_delay_ms)
            .unwrap_or(DEFAULT_RETRY_DELAY_MS);
        Duration::from_millis(millis)
    }

    pub fn capture_changeset_content(&self) -> bool {
        env_bool("BOARDPULL_CAPTURE_CHANGESET_CONTENT")
            .or(self.scrape.capture_changeset_content)
            .unwrap_or(false)
    }

    /// Tooltip formats tried in order; the stock tracker format is always the
    /// final fallback before the relaxed scan.
    pub fn timestamp_formats(&self) -> Vec<String> {
        let mut formats = self.scrape.timestamp_formats.clone();
        if !formats.iter().any(|format| format == DEFAULT_TOOLTIP_FORMAT) {
            formats.push(DEFAULT_TOOLTIP_FORMAT.to_string());
        }
        formats
    }

    /// Flatten file + environment into the explicit config object the engine
    /// and extractor take. Fails when no backlog URL is configured.
    pub fn scrape_config(&self) -> Result<ScrapeConfig> {
        self.scrape_config_with_url(None)
    }

    /// Like [`scrape_config`](Self::scrape_config), but an explicit URL (a CLI
    /// flag) takes precedence over both the environment and the file.
    pub fn scrape_config_with_url(&self, url: Option<String>) -> Result<ScrapeConfig> {
        let Some(base_url) = url.or_else(|| self.base_url_owned()) else {
            bail!("no backlog URL configured; set BOARDPULL_BASE_URL or [board].base_url");
        };
        Ok(ScrapeConfig {
            base_url,
            work_item_endpoint: self.work_item_endpoint(),
            max_retries: self.max_retries(),
            max_wait_time: self.max_wait_time(),
            poll_interval: self.poll_interval(),
            retry_delay: self.retry_delay(),
            on_prem: self.on_prem(),
            unparented: self.unparented(),
            capture_changeset_content: self.capture_changeset_content(),
            timestamp_formats: self.timestamp_formats(),
        })
    }
}

/// Resolved, concrete scrape settings. Passed explicitly into the traversal
/// engine and extractor; nothing in the core reads process-wide state.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub work_item_endpoint: String,
    pub max_retries: u32,
    pub max_wait_time: Duration,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub on_prem: bool,
    pub unparented: bool,
    pub capture_changeset_content: bool,
    pub timestamp_formats: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            work_item_endpoint: DEFAULT_WORK_ITEM_ENDPOINT.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            max_wait_time: Duration::from_secs(DEFAULT_MAX_WAIT_TIME_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            on_prem: false,
            unparented: false,
            capture_changeset_content: false,
            timestamp_formats: vec![DEFAULT_TOOLTIP_FORMAT.to_string()],
        }
    }
}

/// Login credentials come from the environment only, never from the config
/// file.
pub fn credentials_from_env() -> Option<(String, String)> {
    let email = env_string("BOARDPULL_EMAIL")?;
    let password = env_string("BOARDPULL_PASSWORD")?;
    Some((email, password))
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|value| {
        let lower = value.to_ascii_lowercase();
        lower == "true" || lower == "1" || lower == "yes"
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

/// Load and parse a BoardConfig from a TOML file. Returns default if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BoardConfig> {
    if !config_path.exists() {
        return Ok(BoardConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BoardConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct BoardConfigPatch {
    pub set_base_url: Option<String>,
    pub set_webdriver_url: Option<String>,
}

/// Update selected keys under `[board]` while preserving all other config
/// sections. Returns `true` when a write occurred.
pub fn patch_board_config(config_path: &Path, patch: &BoardConfigPatch) -> Result<bool> {
    if patch.set_base_url.is_none() && patch.set_webdriver_url.is_none() {
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
    let board_entry = root_table
        .entry("board".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let board_table = board_entry
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[board] must be a table in {}", config_path.display()))?;

    if let Some(base_url) = &patch.set_base_url {
        if base_url.trim().is_empty() {
            bail!("base_url cannot be empty");
        }
        board_table.insert("base_url".to_string(), Value::String(base_url.clone()));
    }
    if let Some(webdriver_url) = &patch.set_webdriver_url {
        board_table.insert(
            "webdriver_url".to_string(),
            Value::String(webdriver_url.clone()),
        );
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
