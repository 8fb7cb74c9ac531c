//! Configuration loading from keypipe.toml
//!
//! All fields are optional.  Capture resolves the configuration once
//! and hands the resolved copy to its children through the launch
//! environment, so all three roles agree on the wire contract.

use crate::error::PipelineError;
use crate::frame::{FrameSpec, Framing, HEADER_LEN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the file looked up by [`Config::discover`]
pub const CONFIG_FILE: &str = "keypipe.toml";

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Wire format for all three channels
    #[serde(default)]
    pub framing: Framing,
    /// Size of the Capture to Renderer echo frames
    #[serde(default = "default_echo_frame_size")]
    pub echo_frame_size: usize,
    /// Size of line frames, which is also the longest line that
    /// Capture will submit
    #[serde(default = "default_line_frame_size")]
    pub line_frame_size: usize,
    /// How long Renderer waits for its channels to drain after Terminate
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// How long Capture waits for a child before killing it
    #[serde(default = "default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,
    /// Fallback tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Control units recognised by Capture
    #[serde(default)]
    pub keys: Keys,
}

/// Input bytes that Capture treats as control units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    #[serde(default = "default_kill")]
    pub kill: u8,
    #[serde(default = "default_submit")]
    pub submit: u8,
    #[serde(default = "default_terminate")]
    pub terminate: u8,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            kill: default_kill(),
            submit: default_submit(),
            terminate: default_terminate(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            echo_frame_size: default_echo_frame_size(),
            line_frame_size: default_line_frame_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            reap_timeout_ms: default_reap_timeout_ms(),
            log_filter: default_log_filter(),
            keys: Keys::default(),
        }
    }
}

fn default_echo_frame_size() -> usize {
    16
}
fn default_line_frame_size() -> usize {
    256
}
fn default_kill() -> u8 {
    0x0B // Ctrl-K
}
fn default_submit() -> u8 {
    b'E'
}
fn default_terminate() -> u8 {
    b'T'
}
fn default_shutdown_grace_ms() -> u64 {
    250
}
fn default_reap_timeout_ms() -> u64 {
    2000
}
fn default_log_filter() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Discover and load configuration by walking up from the current
    /// directory.  The first file found must be valid.
    pub fn discover() -> Result<Option<Self>, PipelineError> {
        Self::discover_from(std::env::current_dir()?)
    }

    fn discover_from(mut dir: PathBuf) -> Result<Option<Self>, PipelineError> {
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path).map(Some);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    /// Parse and validate TOML text
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize for handing to a child process
    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Check that the frame sizes are usable and the control keys distinct
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.echo_frame_size == 0 || self.line_frame_size == 0 {
            return Err(PipelineError::Config("frame sizes must be non-zero".into()));
        }
        let limit = (1usize << (8 * HEADER_LEN)) - 1;
        if self.framing == Framing::LengthPrefixed && self.line_frame_size > limit {
            return Err(PipelineError::Config(format!(
                "line_frame_size {} exceeds length-prefix limit {}",
                self.line_frame_size, limit
            )));
        }
        let k = &self.keys;
        if k.kill == k.submit || k.kill == k.terminate || k.submit == k.terminate {
            return Err(PipelineError::Config("control keys must be distinct".into()));
        }
        Ok(())
    }

    pub fn echo_spec(&self) -> FrameSpec {
        FrameSpec::echo(self.framing, self.echo_frame_size)
    }

    pub fn line_spec(&self) -> FrameSpec {
        FrameSpec::line(self.framing, self.line_frame_size)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_legacy_contract() {
        let config = Config::default();
        assert_eq!(config.framing, Framing::Fixed);
        assert_eq!(config.echo_frame_size, 16);
        assert_eq!(config.line_frame_size, 256);
        assert_eq!(config.keys.kill, 11);
        assert_eq!(config.keys.submit, b'E');
        assert_eq!(config.keys.terminate, b'T');
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::parse(
            r#"
framing = "length-prefixed"
shutdown_grace_ms = 1000

[keys]
submit = 13
"#,
        )
        .unwrap();
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.keys.submit, 13);
        assert_eq!(config.keys.terminate, b'T');
        assert_eq!(config.line_frame_size, 256);
    }

    #[test]
    fn test_child_handoff_preserves_config() {
        let mut config = Config::default();
        config.framing = Framing::LengthPrefixed;
        config.reap_timeout_ms = 42;
        let text = config.to_toml().unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_clashing_keys() {
        let err = Config::parse("[keys]\nsubmit = 84\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_rejects_unrepresentable_length() {
        let err = Config::parse("framing = \"length-prefixed\"\nline_frame_size = 70000\n");
        assert!(err.is_err());
        // Fixed framing has no header to overflow
        assert!(Config::parse("line_frame_size = 70000\n").is_ok());
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("keypipe-config-{}-{}", std::process::id(), name));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        root
    }

    #[test]
    fn test_discover_walks_up() {
        let root = scratch_dir("found");
        std::fs::write(root.join(CONFIG_FILE), "reap_timeout_ms = 7\n").unwrap();
        let config = Config::discover_from(root.join("a").join("b")).unwrap().unwrap();
        assert_eq!(config.reap_timeout_ms, 7);
    }

    #[test]
    fn test_discover_reports_bad_file() {
        let root = scratch_dir("bad");
        std::fs::write(root.join("a").join(CONFIG_FILE), "framing = 5\n").unwrap();
        let err = Config::discover_from(root.join("a").join("b")).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_frames() {
        assert!(Config::parse("echo_frame_size = 0\n").is_err());
    }
}
