use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::WarnLevel;
use directories::ProjectDirs;
use gridpin_node::NodeConfig;
use gridpin_store::PinStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Inspect a gridpin pin store", long_about = None)]
struct Cli {
    /// Directory holding the pin store; defaults to the gridpin data
    /// directory
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<WarnLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all pins, or the pins of one file, or one pin by id
    Ls {
        /// File id, or a numeric pin id
        target: Option<String>,
    },
    /// List the requests attached to a pin
    Requests { pin_id: u64 },
    /// Show the effective node configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let dirs = ProjectDirs::from("", "", "gridpin")
        .context("failed to determine config directory path")?;

    match cli.cmd {
        Commands::Config => {
            let config_file = dirs.config_dir().join("config.toml");
            let config: NodeConfig = match std::fs::read_to_string(&config_file) {
                Ok(text) => toml::from_str(&text)
                    .with_context(|| format!("failed to parse {}", config_file.display()))?,
                Err(_) => NodeConfig::default(),
            };
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        cmd => {
            let db_dir = cli.db.unwrap_or_else(|| dirs.data_dir().to_path_buf());
            let store = PinStore::open(&db_dir)
                .with_context(|| format!("failed to open pin store in {}", db_dir.display()))?;
            run_query(&store, cmd)
        }
    }
}

fn run_query(store: &PinStore, cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Ls { target: None } => {
            for (pin, requests) in store.all_pins()? {
                println!("{pin}");
                for request in requests {
                    println!("  {request}");
                }
            }
        }
        Commands::Ls {
            target: Some(target),
        } => match target.parse::<u64>() {
            Ok(pin_id) => {
                let Some(pin) = store.pin_by_id(pin_id)? else {
                    anyhow::bail!("no pin with id {pin_id}");
                };
                println!("{pin}");
                for request in store.requests_for_pin(pin_id)? {
                    println!("  {request}");
                }
            }
            Err(_) => {
                let file: gridpin_core::FileId = target
                    .parse()
                    .map_err(|_| anyhow::anyhow!("empty file id"))?;
                for pin in store.pins_for_file(&file)? {
                    println!("{pin}");
                }
            }
        },
        Commands::Requests { pin_id } => {
            for request in store.requests_for_pin(pin_id)? {
                println!("{request}");
            }
        }
        Commands::Config => unreachable!("handled above"),
    }
    Ok(())
}
