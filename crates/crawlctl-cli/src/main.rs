mod config;
mod run_cmd;
mod serve_cmd;
mod site_config;
#[cfg(test)]
mod test_util;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crawlctl_core::Orchestrator;

use config::CrawlctlConfig;

#[derive(Parser)]
#[command(name = "crawlctl", about = "Crawl-worker fleet orchestrator")]
struct Cli {
    /// Config file (overrides the default XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default crawlctl config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP control plane
    Serve {
        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Launch one worker in the foreground and print its output. Ctrl+C
    /// stops it; a second Ctrl+C kills its process group and exits.
    Run {
        /// Export destination handed to the worker
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Execute the `crawlctl init` command: write config file.
fn cmd_init(config_override: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_override
        .map(Path::to_path_buf)
        .unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!(
        "  worker.program = {} {}",
        cfg.worker.program,
        cfg.worker.args.join(" ")
    );
    println!("  capture.tag = {}", cfg.capture.tag);
    println!();
    println!("Next: run `crawlctl serve` to start the control plane.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(cli.config.as_deref(), force)?;
        }
        Commands::Serve { bind, port } => {
            let resolved = CrawlctlConfig::resolve(cli.config.as_deref(), bind.as_deref(), port)?;
            let state = serve_cmd::AppState {
                orchestrator: Orchestrator::new(resolved.orchestrator),
                site_config_path: resolved.site_config_path,
            };
            serve_cmd::run_serve(state, &resolved.bind, resolved.port).await?;
        }
        Commands::Run { output } => {
            let resolved = CrawlctlConfig::resolve(cli.config.as_deref(), None, None)?;
            let orch = Orchestrator::new(resolved.orchestrator);
            let code = run_cmd::run_foreground(orch, output.as_deref()).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}
