//! Audio frames, transcripts and synthesized chunks.

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample encoding carried by an [`AudioFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    #[default]
    Pcm16,
    /// Opus packets.
    Opus,
}

/// Sample format of a captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default)]
    pub encoding: AudioEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            encoding: AudioEncoding::Pcm16,
        }
    }
}

/// Voice-activity flag set by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vad {
    Speech,
    #[default]
    Silence,
}

/// Errors raised while decoding frame payloads.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// One fixed-size chunk of captured audio.
///
/// `data` carries the raw samples as base64 text so frames survive JSON
/// transport unchanged. Frames are consumed once and never retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFrame {
    pub seq: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default)]
    pub vad: Vad,
    #[serde(default)]
    pub rms: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AudioFrame {
    /// Whether the client flagged this frame as containing speech.
    pub fn is_speech(&self) -> bool {
        self.vad == Vad::Speech
    }

    /// Decodes the base64 sample payload. Frames without a payload yield an
    /// empty buffer.
    pub fn samples(&self) -> Result<Vec<u8>, FrameError> {
        match &self.data {
            Some(encoded) => Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?),
            None => Ok(Vec::new()),
        }
    }
}

/// One speech-to-text output.
///
/// A partial result is superseded by the next one; a result with
/// `is_final` set triggers reply generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptResult {
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
    pub timestamp: i64,
}

impl TranscriptResult {
    /// Joins a run of partial results into one final transcript.
    ///
    /// Texts are joined with single spaces and confidence is averaged.
    /// Returns `None` when no partial carries any text.
    pub fn merge_partials(partials: &[TranscriptResult]) -> Option<TranscriptResult> {
        let texts: Vec<&str> = partials
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            return None;
        }

        let confidence =
            partials.iter().map(|p| p.confidence).sum::<f32>() / partials.len() as f32;

        Some(TranscriptResult {
            text: texts.join(" "),
            confidence,
            is_final: true,
            timestamp: crate::now_millis(),
        })
    }
}

/// One synthesized audio chunk. The final chunk of an utterance has
/// `is_last` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub is_last: bool,
}

impl AudioChunk {
    /// Splits a PCM buffer into chunks of at most `chunk_size` bytes, flagging
    /// the last one. An empty buffer still produces a single empty final chunk
    /// so callers always observe an end marker.
    pub fn split(pcm: &[u8], chunk_size: usize) -> Vec<AudioChunk> {
        let chunk_size = chunk_size.max(1);
        let timestamp = crate::now_millis();
        if pcm.is_empty() {
            return vec![AudioChunk {
                data: Vec::new(),
                timestamp,
                is_last: true,
            }];
        }

        let total = pcm.len().div_ceil(chunk_size);
        pcm.chunks(chunk_size)
            .enumerate()
            .map(|(i, part)| AudioChunk {
                data: part.to_vec(),
                timestamp,
                is_last: i + 1 == total,
            })
            .collect()
    }

    /// The payload encoded as standard base64.
    pub fn data_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
