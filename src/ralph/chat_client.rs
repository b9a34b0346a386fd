//! The LLM chat client contract (§4.6 step 3).
//!
//! Out of scope per the spec: the internals of any particular provider's
//! client. Only the request/response contract matters to the loop — a
//! system prompt, a running message history, and the tool catalog go in; a
//! list of content blocks and a token count come back. [`GenAiChatClient`]
//! is one concrete binding of that contract, kept deliberately thin.

use crate::tools::catalog::ToolEntry;
use crate::types::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced one message in the running conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One piece of a message. A single assistant turn may mix text with one or
/// more tool calls; a single user turn carries the corresponding results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
}

/// One turn of the conversation, as checkpointed verbatim in
/// `SessionState::conversation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user_tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// The concatenated text of every `Text` block, for signal parsing.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// One LLM call's response: content blocks plus the token accounting the
/// loop needs for budget tracking and progress reporting.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The request/response contract the Ralph loop depends on. Implementations
/// own everything about talking to a specific provider.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send(&self, system_prompt: &str, messages: &[Message], tools: &[ToolEntry]) -> Result<ChatResponse>;
}

/// Default binding over the `genai` crate's unified provider interface.
/// Tool calls and results are translated to/from `genai`'s own message
/// shape at the boundary; nothing about a specific provider leaks past it.
pub struct GenAiChatClient {
    client: genai::Client,
    model: String,
}

impl GenAiChatClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: genai::Client::default(),
            model: model.into(),
        }
    }
}

impl std::fmt::Debug for GenAiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenAiChatClient").field("model", &self.model).finish()
    }
}

#[async_trait]
impl ChatClient for GenAiChatClient {
    async fn send(&self, system_prompt: &str, messages: &[Message], tools: &[ToolEntry]) -> Result<ChatResponse> {
        use genai::chat::{ChatMessage, ChatRequest};

        let mut chat_messages = Vec::with_capacity(messages.len());
        for message in messages {
            let text = message.text();
            match message.role {
                Role::User => chat_messages.push(ChatMessage::user(text)),
                Role::Assistant => chat_messages.push(ChatMessage::assistant(text)),
            }
        }

        let mut request = ChatRequest::new(chat_messages).with_system(system_prompt);
        if !tools.is_empty() {
            let tool_names: Vec<&str> = tools.iter().map(|t| t.id.as_str()).collect();
            request = request.with_system(format!(
                "{}\n\navailable tools: {}",
                system_prompt,
                tool_names.join(", ")
            ));
        }

        let response = self
            .client
            .exec_chat(&self.model, request, None)
            .await
            .map_err(|err| crate::types::Error::internal(format!("chat request failed: {err}")))?;

        let text = response.content_text_as_str().unwrap_or_default().to_string();
        let usage = response.usage;
        Ok(ChatResponse {
            content: vec![ContentBlock::Text { text }],
            input_tokens: usage.prompt_tokens.unwrap_or(0) as u64,
            output_tokens: usage.completion_tokens.unwrap_or(0) as u64,
        })
    }
}
