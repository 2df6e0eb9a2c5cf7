//! Configuration management for apimend
//!
//! Settings live in `<project>/apimend.toml`. Secrets never do: the
//! reasoning-engine key comes from the environment or the system keychain.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "apimend.toml";
pub const DEFAULT_MARKER: &str = "# GENERATED_BY_AGENT";

const KEYRING_SERVICE: &str = "apimend";
const KEYRING_USERNAME: &str = "openrouter_api_key";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the test sources; the only tree capabilities may touch.
    pub test_root: PathBuf,
    /// Where the capture hook drops one JSON record per failing test.
    pub failures_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub api_base_url: String,
    pub test_command: String,
    pub test_args: Vec<String>,
    pub test_timeout_secs: u64,
    /// Bound for whole-suite runs (initial discovery and final verification).
    pub suite_timeout_secs: u64,
    pub api_timeout_secs: u64,
    pub reasoning_timeout_secs: u64,
    pub max_attempts: u32,
    /// Invocation rounds the engine gets inside one attempt.
    pub max_tool_rounds: u32,
    pub max_generations: usize,
    pub model: String,
    /// Optional TOML endpoint catalog replacing the built-in one.
    pub catalog: Option<PathBuf>,
    pub generated_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_root: PathBuf::from("tests/api"),
            failures_dir: PathBuf::from("failures"),
            backup_dir: PathBuf::from("failures/.backups"),
            api_base_url: "https://jsonplaceholder.typicode.com".to_string(),
            test_command: "pytest".to_string(),
            test_args: vec!["-v".to_string(), "--tb=short".to_string()],
            test_timeout_secs: 30,
            suite_timeout_secs: 120,
            api_timeout_secs: 10,
            reasoning_timeout_secs: 120,
            max_attempts: 3,
            max_tool_rounds: 6,
            max_generations: 5,
            model: "anthropic/claude-sonnet-4.5".to_string(),
            catalog: None,
            generated_marker: DEFAULT_MARKER.to_string(),
        }
    }
}

impl Config {
    /// Load `<project>/apimend.toml`, or return defaults.
    ///
    /// A file that fails to parse is moved aside so the user can inspect it,
    /// and defaults are used for this run.
    pub fn load(project_root: &Path) -> Self {
        let path = project_root.join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(&path, &content);
                eprintln!(
                    "  Warning: {} could not be parsed ({}). It was saved as {}.corrupt and defaults were loaded.",
                    CONFIG_FILE, err, CONFIG_FILE
                );
                Self::default()
            }
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn suite_timeout(&self) -> Duration {
        Duration::from_secs(self.suite_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }

    /// Get the OpenRouter API key (environment first, then keychain)
    pub fn api_key() -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }

        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read API key from system keychain");
                eprintln!(
                    "  Tip: Set the {} environment variable as a workaround.",
                    API_KEY_ENV
                );
                None
            }
        }
    }
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
