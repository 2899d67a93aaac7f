//! Verta CLI - Command-line interface
//!
//! Usage:
//!   verta initialize --asin <asin> --user-id <id>
//!   verta ask --asin <asin> --user-id <id> <question>
//!   verta sweep

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use verta_core::config::AppConfig;
use verta_core::store::PgProductStore;
use verta_rag::{
    AgentClients, ChatService, ConversationGraph, EventSink, GraphEvent, NodeId, PromptSet,
    RestoreReport, RetrieverCache,
};
use verta_vector::create_embedding_client;

#[derive(Parser)]
#[command(name = "verta")]
#[command(about = "Product Q&A over customer reviews")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, global = true, env = "VERTA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the review retriever for a product
    Initialize {
        #[arg(long)]
        asin: String,
        #[arg(long)]
        user_id: String,
    },
    /// Ask a question about a product
    Ask {
        #[arg(long)]
        asin: String,
        #[arg(long)]
        user_id: String,
        /// Print the whole result as JSON instead of streaming tokens
        #[arg(long)]
        json: bool,
        question: String,
    },
    /// Delete expired retrievers from the cache directory
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path.clone())?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    let (chat, restored) = build_service(&config).await?;

    match cli.command {
        Commands::Initialize { asin, user_id } => {
            let entry = chat.initialize(&asin, &user_id).await?;
            println!(
                "Retriever initialized for {} ({} reviews) at {}",
                entry.key,
                entry.index.len(),
                entry.index_dir.display()
            );
        }
        Commands::Ask {
            asin,
            user_id,
            json,
            question,
        } => {
            if json {
                let output = chat.invoke(&question, &asin, &user_id).await?;
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                ask_streaming(chat, &question, &asin, &user_id).await?;
            }
        }
        Commands::Sweep => {
            let report = chat.cache().evict_expired(config.cache.ttl()).await;
            println!(
                "Adopted {}, purged {} stale, scanned {}, evicted {}, failed {}",
                restored.adopted,
                restored.purged,
                report.scanned,
                report.evicted,
                report.failed + restored.failed
            );
        }
    }

    Ok(())
}

/// Build the chat service over the retrievers already on disk
async fn build_service(config: &AppConfig) -> anyhow::Result<(Arc<ChatService>, RestoreReport)> {
    let store = Arc::new(PgProductStore::connect_lazy(&config.database)?);
    let embedder = create_embedding_client(&config.llm)?;
    let cache = Arc::new(RetrieverCache::new(&config.cache, store, embedder));
    let restored = cache.restore().await;

    let prompts = Arc::new(PromptSet::load(config.prompts_file.as_deref())?);
    let graph = ConversationGraph::new(AgentClients::from_config(&config.llm)?, prompts)
        .with_retrieval_k(config.cache.retrieval_k);

    let chat = Arc::new(ChatService::new(
        cache,
        Arc::new(graph),
        config.server.request_timeout(),
    ));
    Ok((chat, restored))
}

async fn ask_streaming(
    chat: Arc<ChatService>,
    question: &str,
    asin: &str,
    user_id: &str,
) -> anyhow::Result<()> {
    let context = chat.prepare(asin, user_id).await?;
    let (sink, mut rx) = EventSink::channel(64);

    let runner = Arc::clone(&chat);
    let question = question.to_string();
    let run = tokio::spawn(async move { runner.stream(&question, context, sink).await });

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if let GraphEvent::Token {
            node: NodeId::Generate,
            content,
        } = event
        {
            write!(stdout, "{content}")?;
            stdout.flush()?;
        }
    }
    writeln!(stdout)?;

    let output = run.await??;
    if !output.followup_questions.is_empty() {
        writeln!(stdout, "\nYou might also ask:")?;
        for q in &output.followup_questions {
            writeln!(stdout, "  - {q}")?;
        }
    }
    Ok(())
}
