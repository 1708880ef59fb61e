use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{info, warn};
use std::sync::Arc;

use etica_rag::context::{ConversationStore, DEFAULT_MAX_SESSIONS, DEFAULT_MAX_TURNS};
use etica_rag::database::{LocalIndex, QdrantConfig, QdrantStore, VectorStore};
use etica_rag::openai::{OpenAiClient, OpenAiConfig};
use etica_rag::rag::RagEngine;
use etica_rag::server::{build_router, AppState};
use etica_rag::{DOC_PATH, VECTOR_STORE_PATH};

/// Question answering over the Caixa ethics code, served over HTTP
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "RAG_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Question/answer turns remembered per session
    #[arg(long, env = "RAG_MAX_HISTORY_TURNS", default_value_t = DEFAULT_MAX_TURNS)]
    max_history_turns: usize,

    /// Sessions remembered at once; the least recently used is forgotten first
    #[arg(long, env = "RAG_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Build the vector index at startup when none exists yet
    #[arg(long)]
    build_on_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    // Load configuration from environment
    let openai_config = OpenAiConfig::from_env().context("Missing OPENAI_API_KEY")?;
    let openai = Arc::new(
        OpenAiClient::new(openai_config).context("Failed to initialize OpenAI client")?,
    );

    let store: Arc<dyn VectorStore> = match QdrantConfig::from_env() {
        Some(qdrant_config) => {
            info!("Using Qdrant at {}", qdrant_config.url);
            Arc::new(
                QdrantStore::new(qdrant_config, VECTOR_STORE_PATH)
                    .context("Failed to initialize Qdrant client")?,
            )
        }
        None => Arc::new(LocalIndex::new(VECTOR_STORE_PATH)),
    };

    let engine = Arc::new(RagEngine::new(DOC_PATH, store, openai.clone(), openai));

    if args.build_on_start {
        if engine.index_exists().await? {
            info!("Using existing vector index");
        } else {
            let report = engine
                .build_index()
                .await
                .context("Failed to build vector index")?;
            info!("Built vector index from {} pages", report.pages);
        }
    } else if !engine.index_exists().await.unwrap_or(false) {
        warn!("No vector index yet; call /create_vector_db before asking questions");
    }

    let state = AppState {
        engine,
        conversations: Arc::new(ConversationStore::new(
            args.max_history_turns,
            args.max_sessions,
        )),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!("Listening on http://{}", args.bind);

    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server error")?;

    Ok(())
}
