use crate::error::VoiceError;
use async_trait::async_trait;
use parley_types::{AudioChunk, VoiceModel, VoiceProfile};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for TTS process execution.
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Size of the RIFF header espeak-ng prepends to its output.
const WAV_HEADER_BYTES: usize = 44;

/// Text-to-speech collaborator. The returned chunks are in playback order
/// and the last one has `is_last` set.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Vec<AudioChunk>, VoiceError>;
}

/// Piper (or espeak-ng for [`VoiceModel::System`]) driven as a subprocess.
#[derive(Debug, Clone)]
pub struct PiperTts {
    voices_dir: PathBuf,
    piper_binary: PathBuf,
    profile: VoiceProfile,
    chunk_size: usize,
}

impl PiperTts {
    pub fn new(
        voices_dir: impl AsRef<Path>,
        piper_binary: impl AsRef<Path>,
        profile: VoiceProfile,
        chunk_size: usize,
    ) -> Self {
        Self {
            voices_dir: voices_dir.as_ref().to_path_buf(),
            piper_binary: piper_binary.as_ref().to_path_buf(),
            profile,
            chunk_size,
        }
    }

    pub fn profile(&self) -> &VoiceProfile {
        &self.profile
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.voices_dir.join(path)
        }
    }

    async fn synthesize_piper(&self, text: &str) -> Result<Vec<u8>, VoiceError> {
        let model_path = self.resolve(&self.profile.model_path);
        if !model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        if self.profile.speed < 0.1 || self.profile.speed > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        let mut command = Command::new(&self.piper_binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            // Piper's length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / self.profile.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config) = &self.profile.config_path {
            command.arg("--config").arg(self.resolve(config));
        }

        if let Some(speaker) = self.profile.speaker_id {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = text.to_string();

        // Written from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(TTS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    TTS_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr.trim())));
        }

        Ok(output.stdout)
    }

    async fn synthesize_system(&self, text: &str) -> Result<Vec<u8>, VoiceError> {
        let mut command = Command::new("espeak-ng");
        command
            .arg("--stdout")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn espeak-ng: {}", e)))?;

        let output = tokio::time::timeout(TTS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "System TTS process timed out after {} seconds",
                    TTS_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for espeak-ng: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("espeak-ng failed: {}", stderr.trim())));
        }

        let mut wav = output.stdout;
        if wav.len() > WAV_HEADER_BYTES {
            wav.drain(..WAV_HEADER_BYTES);
        }
        Ok(wav)
    }
}

#[async_trait]
impl TextToSpeech for PiperTts {
    fn name(&self) -> &str {
        match self.profile.model {
            VoiceModel::Piper => "piper",
            VoiceModel::System => "espeak-ng",
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<AudioChunk>, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let pcm = match self.profile.model {
            VoiceModel::Piper => self.synthesize_piper(text).await?,
            VoiceModel::System => self.synthesize_system(text).await?,
        };
        Ok(AudioChunk::split(&pcm, self.chunk_size))
    }
}

/// Silent stand-in: one zeroed chunk per word.
#[derive(Debug, Clone)]
pub struct SilenceTts {
    chunk_size: usize,
}

impl SilenceTts {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for SilenceTts {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl TextToSpeech for SilenceTts {
    fn name(&self) -> &str {
        "silence"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<AudioChunk>, VoiceError> {
        let words = text.split_whitespace().count();
        if words == 0 {
            return Ok(AudioChunk::split(&[], self.chunk_size));
        }
        let timestamp = parley_types::now_millis();
        Ok((0..words)
            .map(|i| AudioChunk {
                data: vec![0; self.chunk_size],
                timestamp: timestamp + i as i64 * 100,
                is_last: i + 1 == words,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silence_emits_one_chunk_per_word() {
        let tts = SilenceTts::new(16);
        let chunks = tts.synthesize("hello there friend").await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.data.len() == 16));
        assert_eq!(
            chunks.iter().map(|c| c.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
    }

    #[tokio::test]
    async fn silence_empty_text_still_ends() {
        let chunks = SilenceTts::default().synthesize("   ").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert!(chunks[0].data.is_empty());
    }

    #[tokio::test]
    async fn piper_rejects_oversized_text() {
        let tts = PiperTts::new("assets/voices", "piper", VoiceProfile::default(), 4096);
        let text = "a".repeat(MAX_TTS_INPUT_BYTES + 1);
        match tts.synthesize(&text).await {
            Err(VoiceError::Tts(msg)) => assert!(msg.contains("exceeds maximum size")),
            other => panic!("expected size error, got {:?}", other),
        }
    }
}
