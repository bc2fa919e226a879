use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;

mod agent;
mod conversation;
mod error;
mod history;
mod knowledge;
mod models;
mod mood;
mod prompts;
mod server;
mod session;
mod settings;
mod speech;
mod storage;
mod telemetry;
#[cfg(test)]
mod testing;
mod text;

use models::OpenAICompatible;
use settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "fortune_teller")]
#[command(about = "Fortune-teller chat agent with mood-aware replies and speech", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP and websocket API
    Start {
        #[arg(long, default_value = "127.0.0.1:8000")]
        listen: String,
    },
    /// Run a single turn and print the reply
    Ask {
        text: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Add a web page to the knowledge base
    Ingest { url: String },
    /// Forget the stored history of a session
    Reset {
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let client = Arc::new(OpenAICompatible::new(&settings.model));
    let state = server::AppState::build(settings, client.clone(), client).await?;

    match cli.command {
        Commands::Start { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let missing = state.settings.missing_credentials();
            if !missing.is_empty() {
                tracing::warn!(?missing, "running without some credentials; affected tools will report unavailability");
            }
            let state = state.with_metrics(telemetry::metrics_handle());
            server::serve(addr, state).await?;
        }
        Commands::Ask { text: question, session } => {
            if !text::validate_user_input(&question) {
                anyhow::bail!("{}", server::INVALID_INPUT);
            }
            let (_, reply) = server::guarded_turn(state.conversation(session), question.trim().to_string()).await;
            println!("[{}] {}", reply.mood, reply.text);
        }
        Commands::Ingest { url } => {
            let chunks = state.knowledge.ingest_url(&url).await?;
            let total = state.knowledge.count().await?;
            println!("ingested {} chunks from {} ({} passages indexed)", chunks, url, total);
        }
        Commands::Reset { session } => {
            let id = session.unwrap_or_else(|| state.settings.agent.default_session_id.clone());
            let removed = state.turns.history.reset(&id).await?;
            println!("{}: {}", id, if removed { "history cleared" } else { "no stored history" });
        }
    }
    Ok(())
}
