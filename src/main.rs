//! doged — agent-operated Dogecoin wallet daemon.

use clap::Parser;

use doged::app_builder;
use doged::app_context::WalletContext;
use doged::clock::system_clock;
use doged::config::Config;
use doged::shutdown::ShutdownManager;

#[derive(Parser, Debug)]
#[command(name = "doged")]
#[command(about = "Self-custodial Dogecoin wallet daemon for autonomous agents", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "doged.toml")]
    config: String,

    /// Override the configured network ("mainnet" or "testnet")
    #[arg(long)]
    network: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config and exit
    #[arg(long)]
    generate_config: bool,
}

fn init_tracing(config: &Config, verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.output == "file" {
        let path = std::path::Path::new(&config.logging.file_path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "doged.log".to_string());
        let appender = tracing_appender::rolling::daily(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        Some(guard)
    } else {
        if config.logging.format == "json" {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        None
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {}", e);
        std::process::exit(1);
    }
    config.apply_mainnet_safety();

    let _log_guard = init_tracing(&config, args.verbose);

    let network = config.network_type().expect("validated above");
    tracing::info!(
        %network,
        primary = %config.api.primary,
        fallback = %config.api.fallback,
        "🐕 doged starting"
    );

    let context = match WalletContext::build(config, system_clock()) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("Failed to build wallet context: {}", e);
            std::process::exit(1);
        }
    };

    let mut shutdown = ShutdownManager::new();
    if let Err(e) = app_builder::start(context.clone(), &mut shutdown).await {
        tracing::error!("Startup failed: {}", e);
        std::process::exit(1);
    }

    if context.keystore.is_initialized() {
        match context.keystore.get_address() {
            Ok(address) => tracing::info!(%address, "Wallet ready"),
            Err(e) => tracing::warn!(error = %e, "Keystore present but unreadable"),
        }
    } else {
        tracing::info!("No wallet yet — initialize via the command surface");
    }

    shutdown.wait_for_shutdown(context).await;
}
