use clap::{Parser, Subcommand};
use portero::config::{Config, ConfigError};
use portero::Proxy;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "A transparent connection-pooling proxy for MongoDB")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/portero.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_proxy(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);

    info!("Starting portero v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.proxy.listen_addr);
    info!("Proxying to: {}", config.proxy.mongo_addr);

    let mut proxy = Proxy::new(config.to_proxy_options());
    proxy
        .start()
        .await
        .map_err(|e| format!("Failed to start proxy: {}", e))?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining sessions");
    proxy.stop(false).await?;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portero run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.proxy.listen_addr);
            println!("  Mongo address: {}", config.proxy.mongo_addr);
            println!("  Pool capacity: {}", config.pool.max_connections);
            println!(
                "  Per-client cap: {}",
                config.proxy.max_per_client_connections
            );
            println!(
                "  Authentication: {}",
                if config.auth.is_some() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("portero v{}", env!("CARGO_PKG_VERSION"));
    println!("A transparent connection-pooling proxy for MongoDB");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Bounded upstream connection pool with idle eviction");
    println!("  • Sticky getLastError handling across mutations");
    println!("  • Per-IP admission limits");
    println!("  • Graceful and hard shutdown");
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
