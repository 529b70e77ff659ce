//! relay-server - service entry point.
//!
//! Wires settings, tracing, the SQL stores, and the external collaborator
//! stubs, then serves the router. Production deployments swap the echo
//! router, static verifier, and passthrough renderer for the real
//! integrations.

use anyhow::Context;
use async_trait::async_trait;
use flowgraph_core::{Message, MessageRole};
use llm_gateway::{
    ChatRequest, ChatResponse, ChunkStream, ModelProfile, ModelRouter, StreamChunk, TokenUsage,
};
use relay::api::create_router;
use relay::auth::{Principal, StaticTokenVerifier, TokenVerifier};
use relay::authz::AccessPolicy;
use relay::config::Settings;
use relay::prompts::PromptLoader;
use relay::render::{
    MarkdownPassthroughRenderer, NullJobSubmitter, StaticProcedureSource,
};
use relay::state::{AppState, Collaborators};
use relay::threads::ThreadRegistry;
use relay::tools::ToolRegistry;
use flowgraph_checkpoint::SqlCheckpointStore;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Development router: echoes the last human message. Replaced by the real
/// LLM router in production wiring.
struct DevEchoRouter {
    settings: Arc<Settings>,
}

#[async_trait]
impl ModelRouter for DevEchoRouter {
    async fn invoke(&self, request: &ChatRequest) -> llm_gateway::Result<ChatResponse> {
        let echo = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Human)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            message: Message::ai(format!("[dev-echo] {echo}")),
            usage: Some(TokenUsage {
                input_tokens: 0,
                output_tokens: 0,
                thinking_tokens: None,
            }),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> llm_gateway::Result<ChunkStream> {
        let response = self.invoke(request).await?;
        let text = response.message.content.clone();
        let chunks = vec![
            Ok(StreamChunk {
                delta: text,
                ..Default::default()
            }),
            Ok(StreamChunk {
                delta: String::new(),
                message: Some(response.message),
                usage: response.usage,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn profile(&self, model: &str) -> ModelProfile {
        if self.settings.model_is_strict(model) {
            ModelProfile::strict()
        } else {
            ModelProfile::default()
        }
    }
}

fn init_tracing(settings: &Settings) {
    let filter =
        EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if settings.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_verifier() -> Arc<dyn TokenVerifier> {
    let token = std::env::var("RELAY_API_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
    let email = std::env::var("RELAY_API_USER").unwrap_or_else(|_| "dev@opgroeien.be".to_string());
    Arc::new(StaticTokenVerifier::new().with_token(
        token,
        Principal {
            user_id: email.clone(),
            email,
        },
    ))
}

fn build_policy(settings: &Settings) -> anyhow::Result<Arc<AccessPolicy>> {
    match &settings.access_config_path {
        Some(path) => Ok(Arc::new(AccessPolicy::from_path(Path::new(path))?)),
        None => {
            // Permissive single-tenant default for local runs.
            let email = std::env::var("RELAY_API_USER")
                .unwrap_or_else(|_| "dev@opgroeien.be".to_string());
            let yaml = format!(
                "users:\n  \"{email}\":\n    account: opgroeien\n    projects:\n      opgroeien:\n        poc: [chat, report]\n"
            );
            Ok(Arc::new(AccessPolicy::from_yaml(&yaml)?))
        }
    }
}

async fn build_procedures() -> anyhow::Result<Arc<StaticProcedureSource>> {
    match std::env::var("PROCEDURES_PATH") {
        Ok(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("cannot read {path}"))?;
            let procedures = serde_json::from_str(&raw)
                .with_context(|| format!("{path} is not a JSON array of procedures"))?;
            Ok(Arc::new(StaticProcedureSource::new(procedures)))
        }
        Err(_) => Ok(Arc::new(StaticProcedureSource::new(Vec::new()))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_path = std::env::var("RELAY_SETTINGS").ok().map(PathBuf::from);
    let settings = Arc::new(Settings::load(settings_path.as_deref())?);
    init_tracing(&settings);

    let max_connections = if settings.database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&settings.database_url)
        .await
        .with_context(|| format!("cannot open database {}", settings.database_url))?;
    let checkpoints = Arc::new(SqlCheckpointStore::with_pool(pool.clone()).await?);
    let threads = Arc::new(ThreadRegistry::new(pool).await?);

    let prompts = Arc::new(PromptLoader::new(
        settings.prompt_dir.as_ref().map(PathBuf::from),
    ));
    let collaborators = Collaborators {
        router: Arc::new(DevEchoRouter {
            settings: Arc::clone(&settings),
        }),
        verifier: build_verifier(),
        policy: build_policy(&settings)?,
        tools: ToolRegistry::new(),
        prompts,
        procedures: build_procedures().await?,
        renderer: Arc::new(MarkdownPassthroughRenderer),
        jobs: Arc::new(NullJobSubmitter),
    };

    let address = format!("{}:{}", settings.server.host, settings.server.port);
    let state = AppState::assemble(
        Arc::clone(&settings),
        checkpoints,
        threads,
        collaborators,
    )
    .await?;

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind {address}"))?;
    info!(%address, "relay-server listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
