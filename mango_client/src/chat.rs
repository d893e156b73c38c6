use crate::api::InferenceApi;
use crate::error::ApiError;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;

pub const APOLOGY: &str = "Sorry, something went wrong. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub sent_at: SystemTime,
}

impl ChatMessage {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            sent_at: SystemTime::now(),
        }
    }
}

/// Conversation with the storage assistant behind `POST /chat/`.
pub struct ChatSession {
    api: Arc<dyn InferenceApi>,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(api: Arc<dyn InferenceApi>) -> Self {
        Self {
            api,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Sends a question and records both sides of the exchange.
    ///
    /// Blank questions are ignored and yield `Ok(None)`. On failure an apology
    /// is appended in place of the answer and the error is returned.
    pub async fn ask(&mut self, question: &str) -> Result<Option<String>, ApiError> {
        if question.trim().is_empty() {
            return Ok(None);
        }
        self.history.push(ChatMessage::new(Role::User, question));

        match self.api.chat(question).await {
            Ok(answer) => {
                self.history
                    .push(ChatMessage::new(Role::Assistant, answer.clone()));
                Ok(Some(answer))
            }
            Err(err) => {
                tracing::error!("Chat request failed: {}", err);
                self.history.push(ChatMessage::new(Role::Assistant, APOLOGY));
                Err(err)
            }
        }
    }
}
