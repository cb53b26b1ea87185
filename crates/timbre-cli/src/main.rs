//! timbre CLI: voice conversion server and client.
//!
//! ```text
//! timbre serve [--port 6575] [--host 0.0.0.0] [--root /root/hay_say] [--architecture so_vits_svc_3]
//! timbre generate --input clip1 --character alice --pitch-shift -3 --output out1 [--server http://localhost:6575]
//! timbre gpu-info [--server ...]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use timbre_lib::cache::FileCache;
use timbre_lib::hardware::CudaSelector;
use timbre_lib::pipeline::ConversionService;
use timbre_lib::timbre_core::types::{DEFAULT_PORT, GenerateResponse, ServiceConfig};

const DEFAULT_SERVER: &str = "http://localhost:6575";

/// timbre: voice conversion server for file-driven engines
#[derive(Parser)]
#[command(name = "timbre", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum CacheImplementation {
    /// WAV files under `<root>/audio_cache`
    File,
}

#[derive(Subcommand)]
enum Command {
    /// Start the conversion server
    Serve {
        /// Listen port
        #[arg(long, env = "TIMBRE_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Listen host
        #[arg(long, env = "TIMBRE_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Installation root holding the architecture, models, venvs and cache
        #[arg(long, env = "TIMBRE_ROOT")]
        root: Option<PathBuf>,
        /// Architecture directory name under the root
        #[arg(long, env = "TIMBRE_ARCHITECTURE")]
        architecture: Option<String>,
        /// Kill the engine after this many seconds (0 waits forever)
        #[arg(long, env = "TIMBRE_ENGINE_TIMEOUT", default_value = "1800")]
        engine_timeout: u64,
        /// Audio cache backend
        #[arg(long, value_enum, default_value = "file")]
        cache_implementation: CacheImplementation,
        /// nvidia-smi binary used for GPU enumeration
        #[arg(long, env = "TIMBRE_NVIDIA_SMI", default_value = "nvidia-smi")]
        nvidia_smi: PathBuf,
    },
    /// Ask a running server to convert a cached clip
    Generate {
        /// Preprocessed clip id
        #[arg(long)]
        input: String,
        /// Character to convert with
        #[arg(long)]
        character: String,
        /// Pitch shift in semitones
        #[arg(long, allow_hyphen_values = true, default_value = "0")]
        pitch_shift: i64,
        /// Output clip id
        #[arg(long)]
        output: String,
        /// GPU id; empty selects the CPU
        #[arg(long, default_value = "")]
        gpu: String,
        /// Session id
        #[arg(long)]
        session: Option<String>,
        /// Server URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// List GPUs visible to the server
    GpuInfo {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timbre=info,timbre_lib=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve {
            port,
            host,
            root,
            architecture,
            engine_timeout,
            cache_implementation,
            nvidia_smi,
        } => {
            let defaults = ServiceConfig::default();
            let config = ServiceConfig {
                root_dir: root.unwrap_or(defaults.root_dir),
                architecture: architecture.unwrap_or(defaults.architecture),
                engine_timeout: (engine_timeout > 0).then(|| Duration::from_secs(engine_timeout)),
            };
            serve(config, cache_implementation, nvidia_smi, &host, port).await
        }

        Command::Generate {
            input,
            character,
            pitch_shift,
            output,
            gpu,
            session,
            server,
        } => {
            let body = serde_json::json!({
                "Inputs": { "User Audio": input },
                "Options": { "Character": character, "Pitch Shift": pitch_shift },
                "Output File": output,
                "GPU ID": gpu,
                "Session ID": session,
            });
            generate(&server, body).await
        }

        Command::GpuInfo { server } => gpu_info(&server).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("timbre: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    config: ServiceConfig,
    cache_implementation: CacheImplementation,
    nvidia_smi: PathBuf,
    host: &str,
    port: u16,
) -> Result<(), String> {
    let cache = match cache_implementation {
        CacheImplementation::File => Arc::new(FileCache::new(config.cache_dir())),
    };
    tracing::info!(
        "architecture {} at {}, cache at {}",
        config.architecture,
        config.architecture_root().display(),
        cache.root().display()
    );

    let service = ConversionService::new(config, cache, Arc::new(CudaSelector::new(nvidia_smi)));
    service
        .prepare()
        .await
        .map_err(|e| format!("failed to create engine directories: {e}"))?;
    let app = timbre_lib::server::router(service);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!("timbre listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn generate(server: &str, body: serde_json::Value) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/generate"))
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let status = resp.status();
    let envelope: GenerateResponse = resp
        .json()
        .await
        .map_err(|e| format!("invalid response ({status}): {e}"))?;
    let message = envelope.decode()?;

    if status.is_success() {
        println!("ok");
        Ok(())
    } else {
        Err(format!("{status}\n{message}"))
    }
}

async fn gpu_info(server: &str) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .get(format!("{server}/gpu-info"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}
