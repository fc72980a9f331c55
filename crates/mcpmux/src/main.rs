use anyhow::Result;
use clap::Parser;
use mcpmux::{BridgeConfig, DEFAULT_PORT};

/// TCP-fronted multiplexer and lifecycle supervisor for MCP services.
#[derive(Debug, Parser)]
#[command(name = "mcpmux", version)]
struct Cli {
    /// TCP port to listen on.
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Default MCP server command.
    #[arg(default_value = "node")]
    default_command: String,

    /// Default arguments for the default MCP command.
    #[arg(trailing_var_arg = true)]
    default_args: Vec<String>,

    /// Address to bind; the bridge is loopback-only by design.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let cfg = BridgeConfig {
        bind: cli.bind,
        port: cli.port,
        default_command: cli.default_command,
        default_args: cli.default_args,
        ..BridgeConfig::default()
    };

    let handle = match mcpmux::start(cfg.clone()).await {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("mcpmux failed to start: {error:#}");
            std::process::exit(1);
        }
    };

    println!("mcpmux listening on {}", handle.addr());
    tracing::info!(
        default_command = %cfg.default_command,
        "bridge started; services are registered at runtime"
    );

    wait_for_signal().await?;
    handle.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
