use clap::Parser;
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use metabase_mcp_runtime::config::{MetabaseArgs, RuntimeConfig};
use metabase_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "metabase-mcp",
    version,
    about = "Metabase MCP server over stdio"
)]
struct Cli {
    #[command(flatten)]
    metabase: MetabaseArgs,

    #[command(subcommand)]
    command: Option<McpCommands>,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing(&cli.metabase.log_level);
    install_panic_hook();

    let config = match RuntimeConfig::from_args(&cli.metabase) {
        Ok(config) => config,
        Err(err) => {
            error!(fatal = true, error = %err, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let code = run_mcp(config, cli.command.unwrap_or(McpCommands::Serve)).await;
    std::process::exit(code);
}

/// JSON records on stderr; stdout belongs to the protocol. `RUST_LOG` wins
/// over `--log-level` when both are set.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        )
        .init();
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(fatal = true, location = %location, panic = %info, "Unexpected panic");
        default_hook(info);
    }));
}
