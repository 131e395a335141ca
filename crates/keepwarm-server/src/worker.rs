//! Default worker program for `keepwarm-server`.
//!
//! Reads the request body from stdin, waits `--delay-ms` to stand in for real
//! work, then writes either `--result` or (with `--echo`) the body itself to
//! stdout. Diagnostics go to stderr so they never mix with the result.

use anyhow::Context;
use clap::Parser;
use core::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keepwarm-worker", version, about = "Example keepwarm worker")]
struct WorkerArgs {
    /// Simulated computation time in milliseconds
    #[arg(long, env = "KEEPWARM_WORKER_DELAY_MS", default_value_t = 4000)]
    delay_ms: u64,

    /// Value written to stdout once the delay elapsed
    #[arg(long, env = "KEEPWARM_WORKER_RESULT", default_value = "done")]
    result: String,

    /// Answer with the request body instead of `--result`
    #[arg(long, env = "KEEPWARM_WORKER_ECHO")]
    echo: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .init();

    let args = WorkerArgs::parse();

    let mut body = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut body)
        .await
        .context("failed to read request body")?;
    tracing::info!("Computing result for {} byte body", body.len());

    tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;

    let result = if args.echo {
        body
    } else {
        args.result.into_bytes()
    };

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&result)
        .await
        .context("failed to write result")?;
    stdout.flush().await.context("failed to flush result")?;

    tracing::info!("Wrote {} byte result", result.len());
    Ok(())
}
