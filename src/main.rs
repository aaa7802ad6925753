//! # DocAI CLI (`docai`)
//!
//! Runs the DocAI HTTP server, or drives the same document library and chat
//! session from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! docai --config ./config/docai.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docai serve` | Start the HTTP API |
//! | `docai signup` | Create an account |
//! | `docai chat` | Interactive chat session |
//! | `docai files list` | List uploaded documents |
//! | `docai files upload <path>` | Upload a Markdown document |
//! | `docai files delete <name>` | Delete a document |
//! | `docai transcript show` | Print the chat transcript |
//! | `docai transcript reset` | Empty the chat transcript |
//! | `docai signout` | Empty the transcript and end the session |
//!
//! Commands other than `serve` sign in first, using `--email`/`--password`
//! or `DOCAI_EMAIL`/`DOCAI_PASSWORD`. Accounts only outlive the process when
//! `[identity].users_file` is configured.
//!
//! ## Examples
//!
//! ```bash
//! export DOCAI_EMAIL=ada@example.com DOCAI_PASSWORD=hunter22
//! docai signup
//! docai files upload ./README.md
//! docai chat --file README.md --model ollama
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use docai::assistant::DocAssistant;
use docai::config::{self, Config};
use docai::inference::ModelSelector;
use docai::server;
use docai::session::{ChatSession, TurnOutcome};

/// DocAI: chat with an assistant about your project documentation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docai.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docai",
    about = "DocAI: chat with an assistant about your project documentation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docai.toml")]
    config: PathBuf,

    /// Account email.
    #[arg(long, global = true, env = "DOCAI_EMAIL")]
    email: Option<String>,

    /// Account password.
    #[arg(long, global = true, env = "DOCAI_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Create an account (and its empty transcript).
    Signup,

    /// Interactive chat.
    ///
    /// Type a question and press Enter. `/use <file>` selects a document,
    /// `/model <openai|ollama>` switches backend, `/files` lists documents,
    /// `/quit` exits.
    Chat {
        /// Document to select before the first turn.
        #[arg(long)]
        file: Option<String>,

        /// Backend to start with (defaults to `[chat].default_model`).
        #[arg(long)]
        model: Option<ModelSelector>,
    },

    /// Manage uploaded documents.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Inspect or reset the chat transcript.
    Transcript {
        #[command(subcommand)]
        action: TranscriptAction,
    },

    /// Empty the transcript and sign out.
    Signout,
}

#[derive(Subcommand)]
enum FilesAction {
    /// List documents with their URLs.
    List,
    /// Upload a local Markdown file.
    Upload {
        path: PathBuf,
        /// Name to store it under (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a document by name.
    Delete { name: String },
}

#[derive(Subcommand)]
enum TranscriptAction {
    Show,
    Reset,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docai=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let assistant = DocAssistant::from_config(&cfg)?;
    let (email, password) = credentials(&cli)?;

    if let Commands::Signup = cli.command {
        let user = assistant
            .sign_up(&email, &password)
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;
        println!("Created account {} (uid {})", user.email, user.uid);
        return Ok(());
    }

    assistant
        .sign_in(&email, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    match cli.command {
        Commands::Serve | Commands::Signup => {}
        Commands::Chat { file, model } => run_chat(&cfg, &assistant, file, model).await?,
        Commands::Files { action } => run_files(&assistant, action).await?,
        Commands::Transcript { action } => match action {
            TranscriptAction::Show => {
                print!("{}", assistant.transcript().await?);
            }
            TranscriptAction::Reset => {
                assistant.reset_transcript().await?;
                println!("Transcript reset.");
            }
        },
        Commands::Signout => {
            assistant.sign_out().await?;
            println!("Signed out.");
        }
    }

    Ok(())
}

fn credentials(cli: &Cli) -> Result<(String, String)> {
    match (&cli.email, &cli.password) {
        (Some(email), Some(password)) => Ok((email.clone(), password.clone())),
        _ => bail!("Credentials required: pass --email and --password or set DOCAI_EMAIL and DOCAI_PASSWORD"),
    }
}

async fn run_files(assistant: &DocAssistant, action: FilesAction) -> Result<()> {
    let user = assistant.require_user()?;
    match action {
        FilesAction::List => {
            let files = assistant.library().list(&user.uid).await;
            if files.is_empty() {
                println!("No documents uploaded.");
            }
            for file in files {
                println!("{}\t{}", file.name, file.url);
            }
        }
        FilesAction::Upload { path, name } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("Cannot derive a file name from {}", path.display()))?,
            };
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let entry = assistant.library().upload(&user.uid, &name, &bytes).await?;
            println!("Uploaded {} ({} bytes)\n{}", entry.name, bytes.len(), entry.url);
        }
        FilesAction::Delete { name } => {
            assistant.library().delete(&user.uid, &name).await?;
            println!("Deleted {}", name);
        }
    }
    Ok(())
}

async fn run_chat(
    cfg: &Config,
    assistant: &DocAssistant,
    file: Option<String>,
    model: Option<ModelSelector>,
) -> Result<()> {
    let session = assistant.require_session()?;
    if let Some(model) = model {
        session.set_model(model);
    }
    if let Some(file) = file {
        select(&session, &file).await;
    }

    println!(
        "DocAI chat ({}; default {}). /use <file>, /model <name>, /files, /quit",
        session.model(),
        cfg.chat.default_model
    );

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
            match name {
                "quit" | "exit" => break,
                "use" => select(&session, arg.trim()).await,
                "model" => match arg.parse::<ModelSelector>() {
                    Ok(model) => {
                        session.set_model(model);
                        println!("Using {}", model);
                    }
                    Err(e) => println!("{}", e),
                },
                "files" => {
                    for f in assistant.library().list(&session.user().uid).await {
                        println!("  {}", f.name);
                    }
                }
                other => println!("Unknown command /{}", other),
            }
            continue;
        }

        match session.submit(line).await {
            TurnOutcome::Answered(reply) => println!("\n{}\n", reply.text),
            TurnOutcome::Rejected => {}
            TurnOutcome::Failed(e) => println!("[error] {}", e),
            TurnOutcome::Stale => println!("[session ended]"),
        }
    }

    session.wait_for_writes().await;
    Ok(())
}

async fn select(session: &Arc<ChatSession>, name: &str) {
    if session.select_document(name).await {
        println!("Using document {}", name);
    } else {
        println!("Could not load {}; continuing without a document", name);
    }
}
