use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use guestgen_contracts::config::IMAGE_CHAT_TYPE;
use guestgen_contracts::{EventLog, GenerationRequest, GenerationResult, GuestConfig};
use guestgen_engine::{build_token_source, GenerationOrchestrator, TokenOracle, TokenStrategy};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_BATCH_PARTIAL: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "guestgen", version, about = "Guest-mode image generation client")]
struct Cli {
    /// Append lifecycle events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = TokenSourceArg::Auto)]
    token_source: TokenSourceArg,
    #[arg(long, global = true)]
    randomize_headers: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TokenSourceArg {
    Auto,
    Browser,
    Endpoints,
}

impl From<TokenSourceArg> for TokenStrategy {
    fn from(value: TokenSourceArg) -> Self {
        match value {
            TokenSourceArg::Auto => TokenStrategy::Auto,
            TokenSourceArg::Browser => TokenStrategy::Browser,
            TokenSourceArg::Endpoints => TokenStrategy::Endpoints,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image in a fresh session.
    Run(RunArgs),
    /// Generate every `{prompt, size?}` item of a JSON array file.
    Batch(BatchArgs),
    /// Generate into an existing session.
    Continue(ContinueArgs),
    /// Open a bare session and print its id.
    Session(SessionArgs),
    /// Acquire a verification token and print it.
    Token,
}

#[derive(Debug, Parser)]
struct RunArgs {
    prompt: String,
    size: Option<String>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    file: PathBuf,
}

#[derive(Debug, Parser)]
struct ContinueArgs {
    session_id: String,
    prompt: String,
    size: Option<String>,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long, default_value = IMAGE_CHAT_TYPE)]
    chat_type: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("guestgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = GuestConfig::from_env();
    if cli.randomize_headers {
        config.randomize_headers = true;
    }
    let events = match &cli.events {
        Some(path) => EventLog::new(path, client_id()),
        None => EventLog::disabled(client_id()),
    };

    let source = build_token_source(&config, cli.token_source.into())?;
    let oracle = Arc::new(
        TokenOracle::new(source, config.token_validity).with_events(events.clone()),
    );
    let orchestrator = GenerationOrchestrator::new(config, Arc::clone(&oracle))?.with_events(events);

    let code = match cli.command {
        Command::Run(args) => {
            let result = orchestrator.generate_once(&args.prompt, args.size.as_deref())?;
            print_result(&result);
            0
        }
        Command::Batch(args) => run_batch(&orchestrator, &args)?,
        Command::Continue(args) => {
            let result = orchestrator.generate_with_existing_session(
                &args.session_id,
                &args.prompt,
                args.size.as_deref(),
            )?;
            print_result(&result);
            0
        }
        Command::Session(args) => {
            let session = orchestrator.create_session(&args.chat_type)?;
            println!("{}", session.id);
            0
        }
        Command::Token => run_token(&oracle)?,
    };
    oracle.shutdown();
    Ok(code)
}

fn run_batch(orchestrator: &GenerationOrchestrator, args: &BatchArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let requests: Vec<GenerationRequest> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of {{prompt, size}}", args.file.display()))?;
    let outcomes = orchestrator.generate_batch(&requests)?;

    let rows = outcomes.iter().map(|outcome| outcome.to_json()).collect::<Vec<Value>>();
    println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);

    let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
    info!(total = outcomes.len(), failed, "batch finished");
    Ok(if failed == 0 { 0 } else { EXIT_BATCH_PARTIAL })
}

fn run_token(oracle: &TokenOracle) -> Result<i32> {
    let first = oracle.get_token()?;
    let second = oracle.get_token()?;
    if first.value != second.value {
        bail!("token changed between consecutive reads");
    }
    let payload = json!({
        "token": first.value,
        "valid_for_secs": oracle.validity().as_secs(),
        "acquisitions": oracle.acquisitions(),
        "second_read_cached": oracle.acquisitions() == 1,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn print_result(result: &GenerationResult) {
    println!("session_id:   {}", result.session_id);
    println!("artifact_url: {}", result.artifact_url);
    println!("prompt:       {}", result.prompt);
    println!("size:         {}", result.size);
}

fn client_id() -> String {
    format!("guestgen-cli-{}", std::process::id())
}
