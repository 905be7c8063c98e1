//! Chat messages and persona framing for the language model.

use serde::{Deserialize, Serialize};

/// Author of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the message list sent to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Identity and style attached to every generated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Label reported alongside replies.
    pub name: String,
    /// System framing prepended to every request.
    pub system_prompt: String,
    /// Greeting spoken when a client asks for one.
    #[serde(default)]
    pub greeting: String,
    /// Farewell spoken when a client asks for one.
    #[serde(default)]
    pub farewell: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Parley".to_string(),
            system_prompt:
                "You are a helpful personal voice assistant. Be concise and natural.".to_string(),
            greeting: "Hi! What can I help you with?".to_string(),
            farewell: "Talk to you later!".to_string(),
        }
    }
}

impl Persona {
    /// Builds the message list for one turn: persona framing, optional
    /// context, then the user's message.
    pub fn frame(&self, message: &str, context: Option<&str>) -> Vec<ChatMessage> {
        let system = match context.map(str::trim).filter(|c| !c.is_empty()) {
            Some(ctx) => format!("{}\n\nContext: {}", self.system_prompt, ctx),
            None => self.system_prompt.clone(),
        };
        vec![ChatMessage::system(system), ChatMessage::user(message)]
    }
}
