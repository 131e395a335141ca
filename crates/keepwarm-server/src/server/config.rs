use clap::Parser;
use core::time::Duration;
use keepwarm_core::{
    Error, StreamConfig, WorkerCommand,
    config::{
        DEFAULT_MAX_BODY_BYTES, DEFAULT_POLL_INTERVAL, DEFAULT_SETTLE_DELAY,
        DEFAULT_STREAM_BUFFER_SIZE,
    },
};
use std::path::PathBuf;

/// Name of the bundled worker binary, looked up next to the server
/// executable when `--worker-program` is not given.
const DEFAULT_WORKER_BIN: &str = "keepwarm-worker";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "keepwarm-server",
    version,
    about = "Streams keep-alive chunks while a worker process computes each response"
)]
pub struct CliArgs {
    /// Address to listen on
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:5000")]
    pub server_addr: String,

    /// Delay before the first keep-alive chunk, in milliseconds
    #[arg(
        long,
        env = "SETTLE_DELAY_MS",
        default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64
    )]
    pub settle_delay_ms: u64,

    /// Interval between keep-alive chunks, in milliseconds (must be > 0)
    #[arg(
        long,
        env = "POLL_INTERVAL_MS",
        default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64
    )]
    pub poll_interval_ms: u64,

    /// Kill workers that run longer than this many milliseconds (0 = never)
    #[arg(long, env = "MAX_DURATION_MS", default_value_t = 0)]
    pub max_duration_ms: u64,

    /// Largest accepted request body in bytes (0 = unlimited)
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Chunks buffered between a stream and the connection
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = DEFAULT_STREAM_BUFFER_SIZE)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight streams during shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Worker executable (defaults to `keepwarm-worker` next to this binary)
    #[arg(long, env = "WORKER_PROGRAM")]
    pub worker_program: Option<PathBuf>,

    /// Argument passed to the worker, kept whole; repeat for several
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Whitespace-separated worker arguments, used when no `--worker-arg` is
    /// given
    #[arg(long, env = "WORKER_ARGS", hide = true, allow_hyphen_values = true)]
    pub worker_args_env: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_addr: String,
    pub stream: StreamConfig,
    pub max_body_bytes: usize,
    pub shutdown_timeout: u64,
    pub worker: WorkerCommand,
}

#[cfg(test)]
impl ServerConfig {
    /// Default settings with the given worker command.
    pub fn with_worker(worker: WorkerCommand) -> Self {
        Self {
            server_addr: "127.0.0.1:5000".to_string(),
            stream: StreamConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_timeout: 5,
            worker,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let stream = StreamConfig {
            settle_delay: Duration::from_millis(args.settle_delay_ms),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            max_duration: (args.max_duration_ms > 0)
                .then(|| Duration::from_millis(args.max_duration_ms)),
            buffer_size: args.stream_buffer_size,
        };
        stream.validate()?;

        let program = match args.worker_program {
            Some(program) => program,
            None => default_worker_program()?,
        };
        let worker_args = match args.worker_args_env {
            Some(joined) if args.worker_args.is_empty() => {
                joined.split_whitespace().map(str::to_string).collect()
            }
            _ => args.worker_args,
        };
        let worker = WorkerCommand::new(program).args(worker_args);

        Ok(Self {
            server_addr: args.server_addr,
            stream,
            max_body_bytes: args.max_body_bytes,
            shutdown_timeout: args.shutdown_timeout,
            worker,
        })
    }
}

fn default_worker_program() -> Result<PathBuf, Error> {
    let exe = std::env::current_exe().map_err(|e| Error::InvalidConfig {
        reason: format!("cannot locate the server executable: {e}"),
    })?;
    let dir = exe.parent().ok_or_else(|| Error::InvalidConfig {
        reason: format!("`{}` has no parent directory", exe.display()),
    })?;
    Ok(dir.join(format!(
        "{DEFAULT_WORKER_BIN}{}",
        std::env::consts::EXE_SUFFIX
    )))
}
