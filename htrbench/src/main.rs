use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use htrbench::config::{CompareMode, Config};
use htrbench::orchestrator::Manager;
use htrbench::runner::{ExitCode, Runner};
use htrbench::services::{adapter_for, ServiceAdapter, SERVICE_NAMES};

#[derive(Parser)]
#[command(name = "htrbench")]
#[command(about = "Submit document images to handwritten-text-recognition services and score the results")]
struct Args {
    /// Files, directories or http(s) URLs of document images
    targets: Vec<String>,

    /// Service to use; repeat for several (default: all)
    #[arg(short = 's', long = "service")]
    services: Vec<String>,

    /// Number of concurrent worker tasks; 1 runs services serially
    #[arg(short = 't', long = "threads")]
    threads: Option<usize>,

    /// Directory for output files (default: next to each input)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Compare results against ground truth: strict or relaxed
    #[arg(short = 'c', long = "compare")]
    compare: Option<String>,

    /// Keep all derived files, raw responses and extracted text
    #[arg(short = 'e', long = "extended")]
    extended: bool,

    /// Read additional targets from a file, one per line
    #[arg(short = 'f', long = "from-file")]
    from_file: Option<PathBuf>,

    /// List the known services and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "htrbench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list {
        for name in SERVICE_NAMES {
            println!("{name}");
        }
        return Ok(());
    }

    let mut config = Config::from_env();
    if let Some(threads) = args.threads {
        if threads == 0 {
            tracing::error!("--threads must be at least 1");
            std::process::exit(ExitCode::BadArg.code());
        }
        config.workers = threads;
    }
    if let Some(output) = args.output {
        config.output_dir = Some(output);
    }
    if let Some(mode) = &args.compare {
        match mode.parse::<CompareMode>() {
            Ok(mode) => config.compare = mode,
            Err(e) => {
                tracing::error!("{e}");
                std::process::exit(ExitCode::BadArg.code());
            }
        }
    }
    config.extended = args.extended;

    if !args.services.is_empty() {
        config.services = args.services.clone();
    }
    let selected: Vec<String> = if config.services.is_empty() {
        SERVICE_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        config.services.clone()
    };
    for name in &selected {
        if !SERVICE_NAMES.contains(&name.as_str()) {
            tracing::error!(
                "Unknown service '{name}'; known services: {}",
                SERVICE_NAMES.join(", ")
            );
            std::process::exit(ExitCode::BadArg.code());
        }
    }

    let mut adapters: Vec<Arc<dyn ServiceAdapter>> = Vec::new();
    for name in &selected {
        match adapter_for(name, &config) {
            Ok(adapter) => adapters.push(Arc::from(adapter)),
            Err(e) => tracing::warn!("Skipping {name}: {e}"),
        }
    }
    if adapters.is_empty() {
        tracing::error!("No services are usable; check credentials");
        std::process::exit(ExitCode::BadArg.code());
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; finishing the current item");
            ctrl_c_cancel.cancel();
        }
    });

    let runner = Runner::new(config.clone(), cancel.clone());

    if !runner.network_available().await {
        tracing::error!("No network connection; the recognition services are unreachable");
        std::process::exit(ExitCode::NoNetwork.code());
    }

    let targets = match runner.gather_targets(&args.targets, args.from_file.as_deref()) {
        Ok(targets) => targets,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(ExitCode::BadArg.code());
        }
    };
    let items = match runner.resolve_targets(&targets).await {
        Ok(items) => items,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(ExitCode::FileError.code());
        }
    };
    tracing::info!(
        "Processing {} item(s) with {} service(s)",
        items.len(),
        adapters.len()
    );

    let manager = Manager::new(adapters, config, cancel.clone());
    let exit = runner.run(&manager, &items).await;
    if exit != ExitCode::Success {
        std::process::exit(exit.code());
    }
    Ok(())
}
