use std::io::{self, Write};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use woocode_core::config::WoocodeSettings;
use woocode_core::config::constants::env as env_keys;
use woocode_core::llm::error_display::format_provider_error;
use woocode_core::llm::registry::ProviderRegistry;
use woocode_core::schema::types::GenerateRequest;
use woocode_core::session::{CancelToken, ChatSession, SessionEvent};

#[derive(Parser, Debug)]
#[command(name = "woocode", version, about = "Coding assistant over interchangeable LLM backends")]
struct Cli {
    /// Backend id (gemini, openai, anthropic, ollama, qwen, llamacpp).
    /// Unset means auto-detection in that order.
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model id; defaults to the backend's default model
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive chat; Ctrl-C stops the current reply and keeps its text
    Chat,

    /// Single prompt; streams the reply and exits
    Ask { prompt: Vec<String> },

    /// List the registered backends
    Providers,

    /// List the models of every reachable backend
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Cli::parse();
    let settings = WoocodeSettings {
        provider: args
            .provider
            .clone()
            .or_else(|| std::env::var(env_keys::WOOCODE_PROVIDER).ok()),
        model: args
            .model
            .clone()
            .or_else(|| std::env::var(env_keys::WOOCODE_MODEL).ok()),
        ..Default::default()
    };
    let registry = ProviderRegistry::from_settings(&settings);

    match args.command.unwrap_or(Commands::Chat) {
        Commands::Providers => {
            list_providers(&registry);
            Ok(())
        }
        Commands::Models => {
            list_models(&registry).await;
            Ok(())
        }
        Commands::Ask { prompt } => {
            let mut session = activate(registry, &settings).await?;
            let outcome = ask_once(&mut session, prompt.join(" ")).await;
            session.registry().write().await.shutdown_all().await;
            outcome
        }
        Commands::Chat => {
            let mut session = activate(registry, &settings).await?;
            let outcome = chat_loop(&mut session).await;
            session.registry().write().await.shutdown_all().await;
            outcome
        }
    }
}

/// Activates the requested backend, or auto-detects one when none was
/// requested, and wraps the registry in a session.
async fn activate(mut registry: ProviderRegistry, settings: &WoocodeSettings) -> Result<ChatSession> {
    let provider = match &settings.provider {
        Some(id) => registry
            .set_active(id)
            .await
            .map_err(|err| anyhow!(format_provider_error(id, None, &err.to_string())))?,
        None => registry
            .auto_detect()
            .await
            .map_err(|err| anyhow!(err.to_string()))?,
    };
    let id = provider.id().to_string();
    let model = settings
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model().to_string());
    eprintln!(
        "{} {} ({})",
        style("using").dim(),
        style(&id).cyan().bold(),
        model
    );

    let mut session = ChatSession::new(registry);
    if let Some(model) = &settings.model {
        session = session.with_model(model.clone());
    }
    Ok(session)
}

fn list_providers(registry: &ProviderRegistry) {
    for entry in registry.list_providers() {
        println!("{:<12} {}", style(&entry.id).cyan(), entry.description);
    }
}

async fn list_models(registry: &ProviderRegistry) {
    let catalogues = registry.list_all_models().await;
    if catalogues.is_empty() {
        println!("no backend is currently reachable");
        return;
    }
    for (id, models) in catalogues {
        println!("{}", style(&id).cyan().bold());
        for model in models {
            println!("  {:<28} {}", model.id, model.display_name);
        }
    }
}

async fn ask_once(session: &mut ChatSession, prompt: String) -> Result<()> {
    stream_turn(session, prompt).await?;
    Ok(())
}

async fn chat_loop(session: &mut ChatSession) -> Result<()> {
    loop {
        print!("{} ", style("you:").green().bold());
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }
        if let Some(id) = input.strip_prefix("/provider ") {
            match session.switch_provider(id.trim(), None).await {
                Ok(()) => eprintln!("{} {}", style("switched to").dim(), style(id.trim()).cyan()),
                Err(err) => eprintln!("{}", format_provider_error(id.trim(), None, &err.to_string())),
            }
            continue;
        }
        if input == "/reset" {
            session.reset();
            continue;
        }

        if let Err(err) = stream_turn(session, input.to_string()).await {
            eprintln!("{err}");
        }
    }
    Ok(())
}

/// Streams one reply to stdout. Ctrl-C cancels the stream; the partial
/// reply stays in the session history.
async fn stream_turn(session: &mut ChatSession, prompt: String) -> Result<()> {
    let (handle, token) = CancelToken::pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    print!("{} ", style("woocode:").yellow().bold());
    io::stdout().flush()?;
    let result = session
        .stream(GenerateRequest::from_text(prompt), token, |event| {
            match event {
                SessionEvent::Content { delta } => {
                    print!("{delta}");
                    io::stdout().flush().ok();
                }
                SessionEvent::FunctionCall { name, args } => {
                    print!("\n{} {name}({args})", style("[call]").magenta());
                }
                SessionEvent::Completed { .. } => {}
            }
        })
        .await;
    interrupt.abort();
    println!();

    match result {
        Ok(_) => Ok(()),
        Err(err) => {
            let provider = err.provider().unwrap_or("backend").to_string();
            Err(anyhow!(format_provider_error(&provider, None, &err.to_string())))
        }
    }
}
