//! Interactive chat against a local OpenAI-compatible server with the
//! context engine keeping the prompt under budget.
//!
//! ```text
//! CONTEXT_ENGINE_PROVIDER__MODEL=llama3.2 cargo run --example chat_session
//! ```

use context_engine::context::ProgressEvent;
use context_engine::logging::init_logging;
use context_engine::prelude::*;
use context_engine::provider::{ChatRequest, StreamChunk};
use context_engine::storage::StorageError;
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = "You are a concise assistant for software engineering tasks.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load(Some(Path::new("context-engine.toml")))?;
    init_logging(&config.logging)?;

    let provider: Arc<dyn ModelProvider> = Arc::new(HttpChatProvider::new(config.provider.clone())?);
    let blobs = open_store(&config.storage).await?;
    let progress = |event: ProgressEvent| tracing::debug!("compression {} ({}%)", event.stage, event.percent);
    let deps = SessionDeps::new(Arc::clone(&provider), blobs).with_progress(Arc::new(progress));

    let session_id = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());
    let session = match ContextOrchestrator::resume(&session_id, SYSTEM_PROMPT, config.clone(), deps.clone()).await {
        Ok(session) => session,
        Err(ContextError::Storage(StorageError::NotFound(_))) => {
            ContextOrchestrator::start(&session_id, SYSTEM_PROMPT, config, deps).await?
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/usage" {
            println!("{}", serde_json::to_string_pretty(&session.get_usage().await)?);
            continue;
        }

        let added = session.add_message(Message::user(line)).await;
        if let Some(error) = added.error {
            eprintln!("warning: {}", error.message);
        }

        let request = ChatRequest {
            messages: session.build_prompt().await,
            ..ChatRequest::default()
        };
        let mut stream = provider.chat_stream(request, CancellationToken::new()).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Text(text) => {
                    print!("{}", text);
                    std::io::stdout().flush()?;
                    reply.push_str(&text);
                }
                StreamChunk::Done { .. } => break,
            }
        }
        println!();

        let added = session.add_message(Message::assistant(reply)).await;
        if added.compression_triggered {
            println!(
                "[context compressed: {} tokens freed, now at {:.0}%]",
                added.tokens_freed.unwrap_or(0),
                added.usage * 100.0
            );
        }
    }

    session.shutdown();
    Ok(())
}
