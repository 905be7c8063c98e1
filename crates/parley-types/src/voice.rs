//! Voice profile and model definitions.
//!
//! A `VoiceProfile` selects the TTS engine used to speak replies and the
//! parameters handed to it.

use serde::{Deserialize, Serialize};

/// Supported TTS engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceModel {
    /// Piper TTS (ONNX-based, fast, local).
    #[default]
    Piper,
    /// espeak-ng, available on most systems.
    System,
}

/// How replies are voiced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// The underlying TTS engine.
    #[serde(default)]
    pub model: VoiceModel,
    /// Path to the model file (relative to the voices directory or absolute).
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// Path to the model configuration file (if applicable).
    #[serde(default)]
    pub config_path: Option<String>,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Speaker ID within a multi-speaker model (0-indexed).
    #[serde(default)]
    pub speaker_id: Option<u32>,
}

fn default_model_path() -> String {
    "en_US-lessac-medium.onnx".to_string()
}

fn default_speed() -> f32 {
    1.0
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            model: VoiceModel::Piper,
            model_path: default_model_path(),
            config_path: None,
            speed: default_speed(),
            speaker_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_deserializes_with_defaults() {
        let profile: VoiceProfile = serde_json::from_str(r#"{"model": "system"}"#).unwrap();
        assert_eq!(profile.model, VoiceModel::System);
        assert_eq!(profile.speed, 1.0);
        assert_eq!(profile.model_path, "en_US-lessac-medium.onnx");
    }
}
