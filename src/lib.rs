pub mod ai;
pub mod auth;
pub mod balance;
pub mod catalog;
pub mod config;
pub mod error;
pub mod generation;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod sources;
pub mod state;
pub mod webhook;
pub mod ws_protocol;

use std::sync::Arc;

use ai::{AiQuestionClient, MockAiClient, OpenAiClient};
use config::{AiProvider, AppConfig};

/// Compiled once at startup and shared by every generation.
pub fn output_validator() -> anyhow::Result<jsonschema::Validator> {
    let schema_raw = include_str!("../contracts/generated_questions.schema.json");
    let schema: serde_json::Value = serde_json::from_str(schema_raw)?;
    jsonschema::draft202012::new(&schema).map_err(|e| anyhow::anyhow!("invalid output schema: {}", e))
}

pub fn build_state(config: AppConfig) -> anyhow::Result<state::AppState> {
    let ai_client: Arc<dyn AiQuestionClient> = match config.ai_provider {
        AiProvider::OpenAi => {
            tracing::info!(model = %config.openai.model, "using OpenAI question generator");
            Arc::new(OpenAiClient::new(&config.openai)?)
        }
        AiProvider::Mock => {
            tracing::warn!("using the offline mock question generator");
            Arc::new(MockAiClient)
        }
    };
    build_state_with_client(config, ai_client)
}

pub fn build_state_with_client(
    config: AppConfig,
    ai_client: Arc<dyn AiQuestionClient>,
) -> anyhow::Result<state::AppState> {
    let validator = output_validator()?;
    Ok(state::AppState::new(config, ai_client, validator))
}
