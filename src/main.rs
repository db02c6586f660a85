use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use storyrelay::config::{Config, THINKING_BUDGET_FAST};
use storyrelay::dispatch::{StreamObserver, SystemInstruction};
use storyrelay::{GenerationRequest, ProviderFactory, RelayError};

/// Send one generation request through the configured provider chain and
/// print the parsed JSON result.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file. Environment variables override it.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Use the overrides of this agent from the config file
    #[arg(long)]
    agent: Option<String>,

    /// Stream the narrative field to stdout while the response arrives
    #[arg(long)]
    stream: bool,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f64>,

    /// Language the model should answer in
    #[arg(long)]
    language: Option<String>,

    /// System instruction part. Repeat for several parts.
    #[arg(long = "system")]
    system: Vec<String>,

    /// Small thinking budget for models that support one
    #[arg(long)]
    fast: bool,

    /// Stream the model's reasoning to stderr
    #[arg(long)]
    show_thoughts: bool,

    /// Full request as JSON (camelCase fields). Flags override it.
    #[arg(long)]
    request: Option<PathBuf>,

    /// User message. Read from stdin when omitted and no request file is given.
    prompt: Option<String>,
}

impl Cli {
    fn into_request(self) -> anyhow::Result<GenerationRequest> {
        let mut req = match &self.request {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("invalid request in {}", path.display()))?
            }
            None => GenerationRequest::default(),
        };

        if let Some(prompt) = self.prompt {
            req.user_message = prompt;
        } else if self.request.is_none() {
            req.user_message = std::io::read_to_string(std::io::stdin())
                .context("failed to read prompt from stdin")?;
        }
        if !self.system.is_empty() {
            req.system_instruction = Some(SystemInstruction::Parts(self.system));
        }
        if self.model.is_some() {
            req.model = self.model;
        }
        if self.temperature.is_some() {
            req.temperature = self.temperature;
        }
        if self.language.is_some() {
            req.language = self.language;
        }
        if self.fast {
            req.thinking_budget = Some(THINKING_BUDGET_FAST);
        }
        req.stream |= self.stream;
        Ok(req)
    }
}

/// Streams the narrative field to stdout and reasoning to stderr. The first
/// stdout failure, usually a closed pipe, stops output and cancels the request.
struct Terminal<W> {
    out: W,
    show_thoughts: bool,
    cancel: CancellationToken,
    failed: Option<std::io::Error>,
}

impl<W> Terminal<W> {
    fn new(out: W, show_thoughts: bool, cancel: CancellationToken) -> Self {
        Self {
            out,
            show_thoughts,
            cancel,
            failed: None,
        }
    }

    fn write(out: &mut impl Write, text: &str, done: bool) -> std::io::Result<()> {
        out.write_all(text.as_bytes())?;
        if done {
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

impl<W: Write + Send> StreamObserver for Terminal<W> {
    fn on_delta(&mut self, delta: &str, done: bool) {
        if self.failed.is_some() {
            return;
        }
        if let Err(e) = Self::write(&mut self.out, delta, done) {
            tracing::warn!("stdout closed, cancelling request: {e}");
            self.cancel.cancel();
            self.failed = Some(e);
        }
    }

    fn on_thought(&mut self, thought: &str, done: bool) {
        if self.show_thoughts && Self::write(&mut std::io::stderr(), thought, done).is_err() {
            self.show_thoughts = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let agent = cli.agent.clone();
    let show_thoughts = cli.show_thoughts;
    let mut req = cli.into_request()?;

    let cancel = CancellationToken::new();
    req.cancellation_token = Some(cancel.clone());
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling request");
            interrupt.cancel();
        }
    });

    let factory = ProviderFactory::new(config)?;
    let chain = match agent.as_deref() {
        Some(name) => factory.chain_for(name),
        None => factory.chain(),
    };

    tracing::info!(stream = req.stream, "storyrelay starting");

    let mut terminal = Terminal::new(std::io::stdout(), show_thoughts, cancel);
    let outcome = chain.submit(&req, &mut terminal).await;
    if let Some(e) = terminal.failed.take() {
        return Err(e).context("failed to write to stdout");
    }

    match outcome {
        Ok(result) => {
            if !result.thoughts.is_empty() && !show_thoughts {
                tracing::info!(thoughts = %result.thoughts, "model thoughts");
            }
            let mut stdout = terminal.out.lock();
            writeln!(stdout, "{}", serde_json::to_string_pretty(&result)?)
                .context("failed to write to stdout")?;
            Ok(())
        }
        Err(RelayError::Cancelled) => {
            tracing::info!("request cancelled");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e.into())
        }
    }
}
