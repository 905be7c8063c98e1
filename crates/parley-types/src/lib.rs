//! Shared types for the Parley voice assistant backend.
//!
//! This crate holds the data shapes that cross crate boundaries: captured
//! audio frames, transcription results, synthesized audio chunks, chat
//! messages exchanged with the language model, and persona/voice settings.
//!
//! Nothing in here performs I/O. Every other crate in the workspace depends
//! on `parley-types` for these definitions, which keeps the dependency graph
//! leaf-first.

pub mod audio;
pub mod conversation;
pub mod voice;

pub use audio::{AudioChunk, AudioEncoding, AudioFormat, AudioFrame, TranscriptResult, Vad};
pub use conversation::{ChatMessage, ChatRole, Persona};
pub use voice::{VoiceModel, VoiceProfile};

/// Milliseconds since the Unix epoch, used for every wire-level timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_after_2024() {
        // 2024-01-01T00:00:00Z
        assert!(now_millis() > 1_704_067_200_000);
    }
}
