use anyhow::Context;
use clap::Parser;
use keypipe::{roles, Config, Framing, Outcome, RendererLinks, RoleKind, Spawned, TransformerLinks};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Type into one process, see it rewritten by a second, shown by a third
#[derive(Parser, Debug)]
#[command(name = "keypipe")]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (default: keypipe.toml in this or a parent directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the channel framing
    #[arg(long, value_enum)]
    framing: Option<Framing>,

    /// Internal: role of this process (used when Capture spawns the others)
    #[arg(long, value_enum, default_value_t = RoleKind::Capture, hide = true)]
    role: RoleKind,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("keypipe: {:#}", e);
            Outcome::Failed.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<Outcome> {
    match cli.role {
        RoleKind::Capture => {
            let mut config = match &cli.config {
                Some(path) => Config::load(path)?,
                None => Config::discover()?.unwrap_or_default(),
            };
            if let Some(framing) = cli.framing {
                config.framing = framing;
            }
            config.validate()?;
            init_tracing(&config.log_filter);
            let exe = std::env::current_exe().context("locating own executable")?;
            Ok(roles::capture(config, &exe)?)
        }
        RoleKind::Transformer => {
            let spawned = Spawned::<TransformerLinks>::from_env().context("transformer launch")?;
            init_tracing(&spawned.config.log_filter);
            Ok(roles::transformer(spawned)?)
        }
        RoleKind::Renderer => {
            let spawned = Spawned::<RendererLinks>::from_env().context("renderer launch")?;
            init_tracing(&spawned.config.log_filter);
            Ok(roles::renderer(spawned)?)
        }
    }
}

fn init_tracing(fallback: &str) {
    // RUST_LOG=keypipe=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
