use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use exec_host::{ExecutionHost, HostConfig, HostResult, config};
use sandbox::ExecutionRequest;
use tokio::io::AsyncReadExt;
use tracing::info;
use uuid::Uuid;

#[derive(Args)]
pub struct RunArgs {
    /// Script to execute, or `-` to read it from stdin
    file: PathBuf,
    /// Path to jsbox.yaml config file
    #[arg(long, short, env = "JSBOX_CONFIG")]
    config: Option<PathBuf>,
    /// Time budget in milliseconds (defaults to the config's `defaults.timeout_ms`)
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Record a line-level execution timeline
    #[arg(long)]
    instrument: bool,
    /// Request id (a random UUID if omitted)
    #[arg(long)]
    id: Option<String>,
    /// Pretty-print the JSON result
    #[arg(long)]
    pretty: bool,
}

async fn read_source(file: &Path) -> HostResult<String> {
    if file == Path::new("-") {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        return Ok(code);
    }
    Ok(tokio::fs::read_to_string(file).await?)
}

/// Run one script and print its result as JSON on stdout.
///
/// Exits non-zero when the result carries an error.
pub async fn run_code(args: RunArgs) -> HostResult<ExitCode> {
    let config = match &args.config {
        Some(path) => config::load(path).await?,
        None => HostConfig::default(),
    };
    let code = read_source(&args.file).await?;

    let host = ExecutionHost::from_config(&config).await?;
    let id = args.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let defaults = host.default_options();
    let request = ExecutionRequest::new(id, code)
        .with_timeout_ms(args.timeout_ms.unwrap_or(defaults.timeout_ms))
        .with_instrument(args.instrument || defaults.instrument);

    let result = host.submit_request(request).await;
    host.shutdown().await;
    info!(request_id = %result.id, duration_ms = result.duration_ms, ok = result.is_ok(), "done");

    let json = if args.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    }
    .map_err(std::io::Error::other)?;
    println!("{json}");

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
