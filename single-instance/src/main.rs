use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use unix_single_instance::Config;
use unix_single_instance::Coordinator;
use unix_single_instance::HandoffMessage;
use unix_single_instance::Role;

#[derive(Parser)]
#[command(name = "unix-single-instance")]
#[command(about = "Run as the single instance or hand arguments to it", long_about = None)]
struct Cli {
    /// Identity shared by all instances (e.g. an application id)
    #[arg(short, long, default_value = "demo")]
    identity: String,

    /// How long to try reaching the running instance, in milliseconds
    #[arg(long, default_value_t = 300)]
    connect_timeout_ms: u64,

    /// How long a held lock with a dead owner is watched before it is
    /// reclaimed, in milliseconds
    #[arg(long, default_value_t = 1000)]
    stale_lock_grace_ms: u64,

    /// Directory for the lock file and socket (default: $XDG_RUNTIME_DIR)
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Arguments handed to the running instance
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(debug_assertions)]
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("unix_single_instance=trace"),
    )
    .init();

    #[cfg(not(debug_assertions))]
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("unix_single_instance=warn"),
    )
    .init();

    let cli = Cli::parse();
    let mut config = Config::new(cli.identity)
        .connect_timeout(Duration::from_millis(cli.connect_timeout_ms))
        .stale_lock_grace(Duration::from_millis(cli.stale_lock_grace_ms));
    if let Some(dir) = cli.runtime_dir {
        config = config.runtime_dir(dir);
    }

    let coordinator = Coordinator::new(config)?;
    let message = HandoffMessage::new(cli.args, std::env::current_dir()?, Utc::now());

    // Output is line oriented so that scripts (and tests) can follow along
    let role = coordinator
        .start(message, |message| {
            let arguments = serde_json::to_string(&message.arguments).unwrap_or_default();
            println!("handoff {}", arguments);
        })
        .await?;

    match role {
        Role::Primary(primary) => {
            println!("primary {}", std::process::id());
            tokio::signal::ctrl_c().await?;
            log::info!("Interrupted, shutting down");
            primary.shutdown().await?;
        }
        Role::HandedOff => {
            println!("handed-off");
        }
    }

    Ok(())
}
