use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ai_llm_service::config::default_config::{config_ollama_chat, config_ollama_embedding};
use ai_llm_service::{ChatMessage, LlmServiceProfiles, telemetry};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use contextor::{Answer, AskRequest, Contextor, ContextorConfig, OllamaChat};
use rag_store::{
    EmbeddingsProvider, HashEmbedder, IndicatifProgress, IngestMode, NoopProgress, OllamaEmbedder, Progress,
    RagConfig, RagStore, SearchFilter,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "movie-rag", about = "Ask questions about a movie catalogue")]
struct Cli {
    /// Embedding backend; `hash` runs fully offline.
    #[arg(long, env = "EMBEDDING_PROVIDER", value_enum, default_value_t = ProviderKind::Ollama)]
    embedding_provider: ProviderKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderKind {
    Ollama,
    Hash,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a movie batch (JSON array, `{results: [...]}` or JSONL).
    Ingest {
        file: PathBuf,
        /// Clear the index before writing.
        #[arg(long)]
        rebuild: bool,
    },
    /// Ask a question and stream the answer.
    Ask {
        question: String,
        /// JSON file with prior `{role, content}` turns.
        #[arg(long)]
        history: Option<PathBuf>,
        /// Filter hints, e.g. `[{"operator":"range","field":"voteAverage","value":{"gte":7}}]`.
        #[arg(long)]
        filter: Option<String>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Ingest this batch first (handy with `INDEX_BACKEND=memory`).
        #[arg(long)]
        preload: Option<PathBuf>,
    },
    /// Number of chunks in the index.
    Count,
    /// Remove every chunk from the index.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("reading .env");
        }
    }

    tracing_subscriber::registry()
        .with(telemetry::env_filter_or("info,rag_store=info,contextor=info"))
        .with(telemetry::layer())
        .try_init()
        .context("installing tracing subscriber")?;

    let cli = Cli::parse();
    let rag_cfg = RagConfig::from_env()?;

    match cli.command {
        Command::Ingest { file, rebuild } => {
            let store = open_store(rag_cfg, cli.embedding_provider).await?;
            let mode = if rebuild {
                IngestMode::Rebuild
            } else {
                store.config().ingest_mode
            };
            let progress = IndicatifProgress::bar(0);
            let report = store.ingest_file(&file, mode, &progress).await?;
            progress.finish("ingest done");
            for failure in &report.errors {
                warn!("document {} failed: {}", failure.document_id, failure.error);
            }
            println!("{report}");
        }
        Command::Ask {
            question,
            history,
            filter,
            top_k,
            preload,
        } => {
            let ctx_cfg = ContextorConfig::from_env()?;
            let store = open_store(rag_cfg, cli.embedding_provider).await?;
            if let Some(path) = preload {
                let report = store
                    .ingest_file(&path, store.config().ingest_mode, &NoopProgress)
                    .await?;
                info!("preloaded {}: {report}", path.display());
            }

            let mut req = AskRequest::new(question);
            if let Some(path) = history {
                req = req.with_history(read_history(&path).await?);
            }
            if let Some(raw) = filter {
                req = req.with_filter(SearchFilter::from_json(&raw)?);
            }
            req.top_k = top_k;

            let chat = Arc::new(OllamaChat::new(llm_profiles(true)?));
            let contextor = Contextor::new(Arc::new(store), chat, ctx_cfg);
            ask(&contextor, req).await?;
        }
        Command::Count => {
            let store = open_store(rag_cfg, cli.embedding_provider).await?;
            println!("{}", store.count().await?);
        }
        Command::Reset => {
            let store = open_store(rag_cfg, cli.embedding_provider).await?;
            store.reset().await?;
            println!("index cleared");
        }
    }

    Ok(())
}

async fn ask(contextor: &Contextor, req: AskRequest) -> anyhow::Result<()> {
    let (mut stream, sources) = match contextor.ask(req).await? {
        Answer::Streaming { stream, sources } => (stream, sources),
        Answer::Fallback { message, reason } => {
            info!(?reason, "answering with fallback");
            println!("{message}");
            return Ok(());
        }
    };

    let cancel = stream.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut out = std::io::stdout();
    let mut failed = false;
    while let Some(fragment) = stream.next_fragment().await {
        match fragment {
            Ok(text) => {
                out.write_all(text.as_bytes())?;
                out.flush()?;
            }
            Err(e) => {
                warn!(error = %e, "generation ended early");
                failed = true;
            }
        }
    }
    ctrl_c.abort();

    if failed {
        writeln!(out, "\n{}", contextor.fallback_answer())?;
    } else {
        writeln!(out)?;
    }
    info!(state = ?stream.state(), fragments = stream.delivered(), "answer finished");
    for s in &sources {
        info!(
            "source: {} (doc {}, score {:.3})",
            s.title.as_deref().unwrap_or("?"),
            s.document_id.as_deref().unwrap_or("?"),
            s.score
        );
    }
    Ok(())
}

async fn open_store(cfg: RagConfig, provider: ProviderKind) -> anyhow::Result<RagStore> {
    let provider: Arc<dyn EmbeddingsProvider> = match provider {
        ProviderKind::Hash => Arc::new(HashEmbedder::new(cfg.space.size)),
        ProviderKind::Ollama => Arc::new(OllamaEmbedder::new(llm_profiles(false)?)),
    };
    Ok(RagStore::open(cfg, provider).await?)
}

/// Commands that never chat fall back to the embedding profile for chat.
fn llm_profiles(with_chat: bool) -> anyhow::Result<Arc<LlmServiceProfiles>> {
    let embedding = config_ollama_embedding()?;
    let chat = if with_chat {
        config_ollama_chat()?
    } else {
        config_ollama_chat().unwrap_or_else(|_| embedding.clone())
    };
    Ok(Arc::new(LlmServiceProfiles::new(chat, embedding)?))
}

async fn read_history(path: &Path) -> anyhow::Result<Vec<ChatMessage>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading history {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing history {}", path.display()))
}
