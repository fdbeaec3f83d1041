use anyhow::{Context as _, Result};
use jsh_types::JshError;
use serde::Deserialize;
use std::os::unix::io::RawFd;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

const ENV_INTERACTIVE: &str = "JSH_INTERACTIVE";
const ENV_WRITE_CHUNK: &str = "JSH_WRITE_CHUNK";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Descriptor of the controlling terminal.
    pub terminal_fd: RawFd,
    /// Force job control on or off; `None` detects it with `isatty`.
    pub interactive: Option<bool>,
    /// Take over the terminal (own process group, ignore job-control signals) on init.
    pub claim_terminal: bool,
    /// Largest single write into a job's stdin.
    pub write_chunk_size: usize,
    /// Scratch size for reads from a job's stdout and stderr.
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            terminal_fd: libc::STDIN_FILENO,
            interactive: None,
            claim_terminal: false,
            write_chunk_size: DEFAULT_CHUNK_SIZE,
            read_buffer_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| JshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `JSH_INTERACTIVE` and `JSH_WRITE_CHUNK` from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_INTERACTIVE) {
            self.interactive = Some(parse_bool(&value).ok_or_else(|| {
                JshError::Config(format!("{ENV_INTERACTIVE}: expected a boolean, got {value:?}"))
            })?);
            debug!("config: {}={:?}", ENV_INTERACTIVE, self.interactive);
        }
        if let Some(value) = lookup(ENV_WRITE_CHUNK) {
            self.write_chunk_size = value.trim().parse().map_err(|_| {
                JshError::Config(format!("{ENV_WRITE_CHUNK}: expected a size, got {value:?}"))
            })?;
            debug!("config: {}={}", ENV_WRITE_CHUNK, self.write_chunk_size);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.write_chunk_size == 0 {
            return Err(JshError::Config("write_chunk_size must be positive".into()).into());
        }
        if self.read_buffer_size == 0 {
            return Err(JshError::Config("read_buffer_size must be positive".into()).into());
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
