use std::path::{Path, PathBuf};

use anyhow::bail;
use serde::{Deserialize, Serialize};

pub const MAX_DIMENSION_LIMIT: u32 = 16384;
pub const FRAME_SKIP_LIMIT: u32 = 1000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigCommand {
    SetMaxDimension(u32),
    SetFrameSkip(u32),
    GetConfig,
}

pub fn config_file() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_default()
        .join("live-previews")
        .join("config.toml")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    live_previews: PreviewSettings,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub settings: PreviewSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PreviewSettings {
    /// Longest edge of the produced preview, in pixels.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Destination frames dropped between captures; 0 captures every frame.
    #[serde(default)]
    pub frame_skip: u32,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        PreviewSettings {
            max_dimension: default_max_dimension(),
            frame_skip: 0,
        }
    }
}

impl PreviewSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.max_dimension == 0 {
            issues.push("live_previews.max_dimension must be greater than 0".to_string());
        } else if self.max_dimension > MAX_DIMENSION_LIMIT {
            issues.push(format!(
                "live_previews.max_dimension {} exceeds the limit of {MAX_DIMENSION_LIMIT}",
                self.max_dimension
            ));
        }
        if self.frame_skip > FRAME_SKIP_LIMIT {
            issues.push(format!(
                "live_previews.frame_skip {} exceeds the limit of {FRAME_SKIP_LIMIT}",
                self.frame_skip
            ));
        }
        issues
    }

    /// Replaces every out-of-range field with its default.
    pub fn sanitized(self) -> PreviewSettings {
        let defaults = PreviewSettings::default();
        PreviewSettings {
            max_dimension: if (1..=MAX_DIMENSION_LIMIT).contains(&self.max_dimension) {
                self.max_dimension
            } else {
                defaults.max_dimension
            },
            frame_skip: if self.frame_skip <= FRAME_SKIP_LIMIT {
                self.frame_skip
            } else {
                defaults.frame_skip
            },
        }
    }
}

fn default_max_dimension() -> u32 { 256 }

impl Config {
    pub fn read(path: &Path) -> anyhow::Result<Config> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &str) -> anyhow::Result<Config> {
        let file: ConfigFile = toml::from_str(buf)?;
        Ok(Config { settings: file.live_previews })
    }

    /// Reads `path` if it exists, falling back to the defaults otherwise.
    pub fn read_or_default(path: &Path) -> anyhow::Result<Config> {
        if path.exists() { Self::read(path) } else { Ok(Config::default()) }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        let file = ConfigFile { live_previews: self.settings };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Validates the entire configuration and returns a list of issues found.
    pub fn validate(&self) -> Vec<String> { self.settings.validate() }

    /// Applies a runtime option change. Changes that would leave the
    /// configuration invalid are rejected and nothing is modified.
    pub fn apply(&mut self, command: &ConfigCommand) -> anyhow::Result<()> {
        let mut settings = self.settings;
        match command {
            ConfigCommand::SetMaxDimension(value) => settings.max_dimension = *value,
            ConfigCommand::SetFrameSkip(value) => settings.frame_skip = *value,
            ConfigCommand::GetConfig => return Ok(()),
        }
        let issues = settings.validate();
        if !issues.is_empty() {
            bail!("{}", issues.join("; "));
        }
        self.settings = settings;
        Ok(())
    }
}
