use clap::{Parser, Subcommand};
use lib::client::HttpTransport;
use lib::conversation::{Message, Sender};
use lib::error::ChatError;
use lib::orchestrator::ChatOrchestrator;
use lib::storage::FileStorage;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "wakechat")]
#[command(about = "Wakechat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: WAKECHAT_CONFIG_PATH or ~/.wakechat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Check the backend, waking it if it is asleep.
    Health {
        /// Config file path (default: WAKECHAT_CONFIG_PATH or ~/.wakechat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat with the backend (interactive). Resumes the previous session if it has not expired.
    Chat {
        /// Config file path (default: WAKECHAT_CONFIG_PATH or ~/.wakechat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Start from an empty conversation instead of restoring the saved one.
        #[arg(long)]
        fresh: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("wakechat {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Health { config }) => {
            if let Err(e) = run_health(config).await {
                log::error!("health check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, fresh }) => {
            if let Err(e) = run_chat(config, fresh).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn build_orchestrator(
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<ChatOrchestrator> {
    let (config, path) = lib::config::load_config(config_path)?;
    let session_path = lib::config::resolve_session_path(&config, &path);
    log::debug!(
        "backend {}, session file {}",
        lib::config::resolve_backend_url(&config),
        session_path.display()
    );
    Ok(ChatOrchestrator::from_config(
        &config,
        Arc::new(HttpTransport::new()),
        Arc::new(FileStorage::new(session_path)),
    ))
}

async fn run_health(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let chat = build_orchestrator(config_path)?;
    let mut progress = |status: &str| eprintln!("{}", status);
    let outcome = chat.readiness().ensure_ready(&mut progress).await?;
    if outcome.is_ready() {
        println!("ready");
        Ok(())
    } else {
        anyhow::bail!("another wake-up is in progress")
    }
}

fn print_message(m: &Message) {
    match m.sender {
        Sender::User => println!("> {}", m.text),
        Sender::Bot if m.is_error => println!("! {}", m.text.trim()),
        Sender::Bot => println!("< {}", m.text.trim()),
    }
}

async fn print_reply(chat: &ChatOrchestrator, result: Result<i64, ChatError>) {
    match result {
        Ok(_) => {
            if let Some(m) = chat.messages().await.last() {
                print_message(m);
            }
        }
        Err(ChatError::ServerStartupFailed { source }) => {
            eprintln!("server did not start ({}); type /retry to try again", source);
        }
        Err(ChatError::AlreadyWaking) => {
            eprintln!("server is still waking up; type /retry to try again");
        }
        Err(ChatError::Validation(reason)) => eprintln!("{}", reason),
        Err(e) => {
            log::debug!("turn failed: {}", e);
            if let Some(m) = chat.messages().await.last().filter(|m| m.is_error) {
                print_message(m);
            }
        }
    }
}

async fn run_chat(config_path: Option<std::path::PathBuf>, fresh: bool) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let chat = build_orchestrator(config_path)?;
    if fresh {
        chat.clear_conversation().await?;
    } else if chat.restore_session().await {
        eprintln!("(restored previous session)");
    }
    for m in chat.messages().await.iter() {
        print_message(m);
    }

    let mut state = chat.subscribe();
    let status_task = tokio::spawn(async move {
        let mut last: Option<String> = None;
        while state.changed().await.is_ok() {
            let s = state.borrow_and_update().clone();
            if s.server_status != last {
                if let Some(ref text) = s.server_status {
                    eprintln!("({})", text);
                }
            }
            last = s.server_status;
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/clear") {
            chat.clear_conversation().await?;
            for m in chat.messages().await.iter() {
                print_message(m);
            }
            continue;
        }
        if input.eq_ignore_ascii_case("/context") {
            let info = chat.context_info().await;
            println!(
                "context: {} messages, {} characters{}",
                info.messages_in_context,
                info.context_characters,
                if info.context_truncated { " (truncated)" } else { "" }
            );
            continue;
        }
        if input.eq_ignore_ascii_case("/retry") {
            match chat.last_failed_user_message().await {
                Some(m) => {
                    let result = chat.retry_message(m.id).await;
                    print_reply(&chat, result).await;
                }
                None => eprintln!("nothing to retry"),
            }
            continue;
        }

        let result = chat.send_message(input).await;
        print_reply(&chat, result).await;
    }

    if let Err(e) = chat.save_now().await {
        log::warn!("could not save session: {:#}", e);
    }
    status_task.abort();
    Ok(())
}
