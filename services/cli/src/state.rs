//! Application State
//!
//! Everything one interactive session needs, wired together once at startup
//! from the loaded [`Config`].

use crate::config::{Config, Provider};
use aidis_core::{
    conversation::{Conversation, DEFAULT_SYSTEM_PROMPT},
    extractor::CommandExtractor,
    history::{ResponseHistory, SharedHistory},
    llm_client::{LLMClient, OpenAICompatibleClient},
    remote::{HttpTransport, RemoteServiceClient},
    router::CommandRouter,
    shell::ShellExecutor,
};
use anyhow::Context;
use async_openai::config::OpenAIConfig;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AppState {
    pub config: Arc<Config>,
    pub history: SharedHistory,
    pub router: CommandRouter,
    /// `None` when no API key is configured for the selected provider.
    pub conversation: Option<Conversation>,
}

impl AppState {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let history =
            ResponseHistory::new(config.history_capacity, CommandExtractor::default()).shared();

        let transport = HttpTransport::new(config.aidis_url.clone(), config.request_timeout)
            .context("Failed to build HTTP client for AIDIS")?;
        let client =
            RemoteServiceClient::new(transport, config.retry_policy(), config.client_id.clone());

        let policy = config
            .safety_policy()
            .context("Failed to load shell denylist")?;
        let shell = ShellExecutor::new(policy, config.shell_timeout);
        let router = CommandRouter::new(client, history.clone(), shell);

        let conversation = match build_llm_client(&config) {
            Some(llm_client) => {
                let system_prompt = config
                    .system_prompt()
                    .context("Failed to load system prompt")?
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
                Some(Conversation::new(
                    llm_client,
                    history.clone(),
                    config.chat_model.clone(),
                    system_prompt,
                ))
            }
            None => {
                warn!(provider = ?config.provider, "No API key configured; chat is disabled");
                None
            }
        };

        Ok(Self {
            config: Arc::new(config),
            history,
            router,
            conversation,
        })
    }
}

fn build_llm_client(config: &Config) -> Option<Arc<dyn LLMClient>> {
    let api_key = config.api_key()?;
    match config.provider {
        Provider::OpenAI => info!("Using OpenAI provider."),
        Provider::Gemini => info!("Using Gemini provider."),
    }
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(config.provider.api_base());
    Some(Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    )))
}
