//! Conversation Turns
//!
//! Drives one model turn at a time: sends the running conversation to the
//! LLM, forwards each streamed chunk to the caller for rendering, and once the
//! stream ends appends the complete response to the shared history.

use crate::{
    history::{ResponseMetadata, SharedHistory},
    llm_client::{LLMClient, LLMStreamEvent},
};
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Messages (user and assistant) kept as model context.
const MAX_CONTEXT_MESSAGES: usize = 40;

/// Prompt used when no system prompt is configured. It teaches the model the
/// embedded command syntax the extractor understands.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful engineering assistant connected to AIDIS, a knowledge and task service.
When something in the conversation is worth remembering, embed a command on its own line:
aidis:context_store {"content": "<what to remember>", "type": "code|decision|error|discussion|planning|completion|milestone|reflections|handoff", "tags": ["optional"], "relevanceScore": 0-10}
When work should be tracked, embed:
aidis:task_create {"title": "<task>", "description": "optional", "type": "general|feature|bugfix|refactor|test|review|documentation", "priority": "low|medium|high|urgent"}
The user decides whether to send these commands to AIDIS."#;

pub struct Conversation {
    llm_client: Arc<dyn LLMClient>,
    history: SharedHistory,
    model_id: String,
    system_prompt: String,
    messages: Vec<ChatCompletionRequestMessage>,
}

impl Conversation {
    pub fn new(
        llm_client: Arc<dyn LLMClient>,
        history: SharedHistory,
        model_id: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm_client,
            history,
            model_id: model_id.into(),
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
        }
    }

    /// Number of user and assistant messages currently kept as context.
    pub fn context_len(&self) -> usize {
        self.messages.len()
    }

    /// Forgets the conversation context. The response history is untouched.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Sends `user_text`, streaming chunks to `on_chunk`, and returns the full
    /// response once the stream completes.
    ///
    /// A stream that fails midway is reported as an error and nothing is
    /// buffered.
    #[instrument(skip_all, fields(model = %self.model_id))]
    pub async fn send<F>(&mut self, user_text: &str, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let user_message: ChatCompletionRequestMessage =
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_text.to_string())
                .build()?
                .into();

        let mut request: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.clone())
                .build()?
                .into(),
        ];
        request.extend(self.messages.iter().cloned());
        request.push(user_message.clone());

        let started = Instant::now();
        let mut stream = self
            .llm_client
            .stream_chat(request)
            .await
            .context("Failed to start model response")?;

        let mut full_response = String::new();
        let mut chunks: u32 = 0;
        while let Some(event) = stream.next().await {
            match event.context("Model response stream failed")? {
                LLMStreamEvent::TextChunk(chunk) => {
                    on_chunk(&chunk);
                    full_response.push_str(&chunk);
                    chunks += 1;
                }
            }
        }
        let response_time_ms = started.elapsed().as_millis() as u64;

        if !full_response.is_empty() {
            self.history.write().await.append(
                full_response.clone(),
                // Streamed chunks are not tokens; no usage is requested.
                Some(ResponseMetadata {
                    model_id: self.model_id.clone(),
                    response_time_ms,
                    ..ResponseMetadata::default()
                }),
            );
        }

        self.messages.push(user_message);
        self.messages.push(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(full_response.clone())
                .build()?
                .into(),
        );
        if self.messages.len() > MAX_CONTEXT_MESSAGES {
            let excess = self.messages.len() - MAX_CONTEXT_MESSAGES;
            self.messages.drain(..excess);
        }

        info!(chunks, response_time_ms, length = full_response.len(), "Model response complete");
        Ok(full_response)
    }
}
