use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
  pub endpoint: String,
  pub model: String,
  pub temperature: f32,
  /// Replaces the one-step system prompt for next-step and question requests.
  pub follow_up_system_prompt: Option<String>,
  pub jpeg_quality: f32,
  pub jpeg_quality_floor: f32,
  pub bind_address: String,
  pub log_events_to_file: bool,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
      model: "gpt-4o".to_string(),
      temperature: 0.7,
      follow_up_system_prompt: None,
      jpeg_quality: 0.8,
      jpeg_quality_floor: 0.1,
      bind_address: "127.0.0.1:7878".to_string(),
      log_events_to_file: true,
    }
  }
}

/// The subset of configuration the request builder needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
  pub model: String,
  pub temperature: f32,
  pub follow_up_system_prompt: Option<String>,
}

impl AppConfig {
  pub fn model_config(&self) -> ModelConfig {
    ModelConfig {
      model: self.model.clone(),
      temperature: self.temperature,
      follow_up_system_prompt: self
        .follow_up_system_prompt
        .clone()
        .filter(|p| !p.trim().is_empty()),
    }
  }
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
  if let Some(dir) = std::env::var_os("SCREENGUIDE_CONFIG_DIR") {
    return Ok(PathBuf::from(dir));
  }
  let base = dirs::config_dir().context("missing config dir")?;
  Ok(base.join("screenguide"))
}

pub fn load_or_init(path: &Path) -> anyhow::Result<AppConfig> {
  if path.exists() {
    let data = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&data)
      .with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(config)
  } else {
    let config = AppConfig::default();
    save_config(path, &config)?;
    Ok(config)
  }
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(config)?;
  std::fs::write(path, json)?;
  Ok(())
}
