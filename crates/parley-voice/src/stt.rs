use crate::error::VoiceError;
use async_trait::async_trait;
use parley_types::{AudioFrame, TranscriptResult, Vad};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for STT process execution.
const STT_TIMEOUT: Duration = Duration::from_secs(120);

/// Speech-to-text collaborator.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribes one frame. `Ok(None)` means the frame produced no text.
    async fn transcribe(&self, frame: &AudioFrame)
        -> Result<Option<TranscriptResult>, VoiceError>;

    /// Turns a run of partial results into a final transcript.
    async fn finalize(
        &self,
        partials: &[TranscriptResult],
    ) -> Result<Option<TranscriptResult>, VoiceError> {
        Ok(TranscriptResult::merge_partials(partials))
    }
}

/// whisper.cpp driven as a subprocess, one invocation per frame.
///
/// whisper.cpp reports no confidence, so results carry `1.0`. A frame the
/// client flagged as silence closes the utterance and its result is final.
#[derive(Debug, Clone)]
pub struct WhisperStt {
    model_path: PathBuf,
    binary_path: PathBuf,
    language: String,
}

impl WhisperStt {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
            language: "en".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    async fn run(&self, audio_data: &[u8]) -> Result<String, VoiceError> {
        if audio_data.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        // -nt: plain text without timestamps on stdout.
        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-l")
            .arg(&self.language)
            .arg("-nt")
            .arg("-f")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("Failed to spawn STT binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Stt("Failed to open stdin".to_string()))?;

        stdin
            .write_all(audio_data)
            .await
            .map_err(|e| VoiceError::Stt(format!("Failed to write to stdin: {}", e)))?;
        drop(stdin);

        let output = tokio::time::timeout(STT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Stt(format!(
                    "STT process timed out after {} seconds",
                    STT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Stt(format!("Failed to read stdout: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {}", stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SpeechToText for WhisperStt {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(
        &self,
        frame: &AudioFrame,
    ) -> Result<Option<TranscriptResult>, VoiceError> {
        let samples = frame.samples()?;
        if samples.is_empty() {
            return Ok(None);
        }

        let text = self.run(&samples).await?;
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(TranscriptResult {
            text,
            confidence: 1.0,
            is_final: frame.vad == Vad::Silence,
            timestamp: parley_types::now_millis(),
        }))
    }
}

const PLACEHOLDER_TEXTS: [&str; 5] = [
    "Hello world",
    "How are you today",
    "The weather is nice",
    "I love programming",
    "Voice recognition is amazing",
];

/// Canned transcripts for development without a whisper.cpp install.
///
/// Speech frames yield a partial picked by sequence number; silence frames
/// yield nothing.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderStt;

impl PlaceholderStt {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpeechToText for PlaceholderStt {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn transcribe(
        &self,
        frame: &AudioFrame,
    ) -> Result<Option<TranscriptResult>, VoiceError> {
        if !frame.is_speech() {
            return Ok(None);
        }
        let text = PLACEHOLDER_TEXTS[(frame.seq % PLACEHOLDER_TEXTS.len() as u64) as usize];
        Ok(Some(TranscriptResult {
            text: text.to_string(),
            confidence: 0.9,
            is_final: false,
            timestamp: parley_types::now_millis(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::AudioFormat;

    fn frame(seq: u64, vad: Vad, data: Option<&str>) -> AudioFrame {
        AudioFrame {
            seq,
            timestamp: 0,
            format: AudioFormat::default(),
            vad,
            rms: 0.2,
            data: data.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn placeholder_transcribes_speech_only() {
        let stt = PlaceholderStt::new();
        let partial = stt
            .transcribe(&frame(1, Vad::Speech, None))
            .await
            .unwrap()
            .expect("speech frame should transcribe");
        assert_eq!(partial.text, "How are you today");
        assert!(!partial.is_final);

        assert!(stt
            .transcribe(&frame(2, Vad::Silence, None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn default_finalize_merges_partials() {
        let stt = PlaceholderStt::new();
        let a = stt.transcribe(&frame(0, Vad::Speech, None)).await.unwrap().unwrap();
        let b = stt.transcribe(&frame(1, Vad::Speech, None)).await.unwrap().unwrap();
        let merged = stt.finalize(&[a, b]).await.unwrap().unwrap();
        assert_eq!(merged.text, "Hello world How are you today");
        assert!(merged.is_final);
        assert!(stt.finalize(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn whisper_skips_frames_without_audio() {
        let stt = WhisperStt::new("model.bin", "/nonexistent/whisper");
        assert!(stt
            .transcribe(&frame(0, Vad::Speech, None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn whisper_rejects_bad_base64() {
        let stt = WhisperStt::new("model.bin", "/nonexistent/whisper");
        let result = stt.transcribe(&frame(0, Vad::Speech, Some("@@not-base64@@"))).await;
        assert!(matches!(result, Err(VoiceError::Frame(_))));
    }

    #[tokio::test]
    async fn whisper_reports_missing_binary() {
        let stt = WhisperStt::new("model.bin", "/nonexistent/whisper");
        // "AAAA" decodes to three zero bytes.
        let result = stt.transcribe(&frame(0, Vad::Speech, Some("AAAA"))).await;
        match result {
            Err(VoiceError::Stt(msg)) => assert!(msg.contains("Failed to spawn")),
            other => panic!("expected spawn failure, got {:?}", other),
        }
    }
}
