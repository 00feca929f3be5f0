// cli/src/main.rs

mod client;
mod error;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client as ReqwestClient;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use client::ApiClient;

/// A basic CLI client for the Tabula analysis service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the Tabula API server
    #[arg(short, long, env = "TABULA_BASE_URL", default_value = "http://127.0.0.1:5001")]
    base_url: Url,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a question and follow its progress to the answer
    Ask {
        /// The natural-language question
        question: String,
        /// Primary data file hint
        #[arg(short, long)]
        filename: Option<String>,
        /// Return the task id immediately instead of following progress
        #[arg(long)]
        no_follow: bool,
    },
    /// Read the current status of a job
    Status { task_id: String },
    /// Tail a job's progress stream
    Stream { task_id: String },
    /// Request cancellation of a running job
    Cancel { task_id: String },
    /// List the data files the service can analyze
    Files,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tabula_cli=info,tabula_backend=warn".into());
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    tracing::info!(base_url = %args.base_url, "Talking to Tabula API");

    let reqwest_client = ReqwestClient::builder()
        .build()
        .context("Failed to build reqwest client")?;
    let api = ApiClient::new(args.base_url, reqwest_client);

    match args.command {
        Command::Ask {
            question,
            filename,
            no_follow,
        } => {
            let task_id = api.submit(&question, filename.as_deref()).await?;
            println!("task: {task_id}");
            if !no_follow {
                follow(&api, &task_id).await?;
            }
        }
        Command::Status { task_id } => {
            let status = api.status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Stream { task_id } => {
            follow(&api, &task_id).await?;
        }
        Command::Cancel { task_id } => {
            let response = api.cancel(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Files => {
            let files = api.list_files().await?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
    }

    Ok(())
}

async fn follow(api: &ApiClient, task_id: &str) -> Result<()> {
    api.stream_progress(task_id, |event| {
        println!("[{:>3}] {:<16} {}", event.seq, event.phase.to_string(), event.detail);
        if let Some(partial) = &event.partial_output {
            for line in partial.lines() {
                println!("      | {line}");
            }
        }
    })
    .await?;
    Ok(())
}
