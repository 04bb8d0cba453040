use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use ipc_worker::{DEFAULT_QUEUE_SIZE, DEFAULT_SHM_SIZE, PoolConfig};

/// Transport connecting the pool to its workers.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Per-worker segments gated by a counting semaphore.
    Shm,
    /// ZeroMQ PUB/SUB fan-out and PUSH/PULL fan-in.
    Zmq,
}

/// Runtime configuration for the `ipc-worker` binary.
///
/// Pool options map one to one onto [`PoolConfig`]; the rest shape the load
/// the binary generates. All values are parsed from CLI arguments or
/// environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ipc-worker",
    version,
    about = "Drives an ipc-worker pool and reports round-trip throughput"
)]
pub struct CliArgs {
    /// Pool backend.
    ///
    /// Environment variable: `IPC_BACKEND`
    #[arg(long, env = "IPC_BACKEND", value_enum, default_value_t = Backend::Shm)]
    pub backend: Backend,

    /// Number of workers.
    ///
    /// Environment variable: `WORKER_NUM`
    #[arg(long, env = "WORKER_NUM", default_value_t = 4)]
    pub worker_num: usize,

    /// Number of dispatch managers (shm backend only).
    ///
    /// Environment variable: `MANAGER_NUM`
    #[arg(long, env = "MANAGER_NUM", default_value_t = 1)]
    pub manager_num: usize,

    /// Byte capacity of each worker segment (shm backend only).
    ///
    /// Environment variable: `SHM_SIZE`
    #[arg(long, env = "SHM_SIZE", default_value_t = DEFAULT_SHM_SIZE)]
    pub shm_size: usize,

    /// Prefix for role, segment and identity names.
    ///
    /// Environment variable: `GROUP_NAME`
    #[arg(long, env = "GROUP_NAME", default_value_t = String::from("ipc"))]
    pub group_name: String,

    /// Capacity of the pool's bounded input and output channels.
    ///
    /// Environment variable: `QUEUE_SIZE`
    #[arg(long, env = "QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,

    /// Seconds allowed for roles to report their address and readiness.
    ///
    /// Environment variable: `STARTUP_TIMEOUT`
    #[arg(long, env = "STARTUP_TIMEOUT", default_value_t = 10)]
    pub startup_timeout: u64,

    /// Log duration and size of every handled request (at debug level).
    ///
    /// Environment variable: `LOG_TIMING`
    #[arg(long, env = "LOG_TIMING", default_value_t = false)]
    pub log_timing: bool,

    /// Total number of requests to submit.
    ///
    /// Environment variable: `REQUESTS`
    #[arg(long, env = "REQUESTS", default_value_t = 10_000)]
    pub requests: usize,

    /// Requests submitted before their replies are collected.
    ///
    /// Environment variable: `IN_FLIGHT`
    #[arg(long, env = "IN_FLIGHT", default_value_t = 64)]
    pub in_flight: usize,

    /// Bytes per request payload.
    ///
    /// Environment variable: `PAYLOAD_SIZE`
    #[arg(long, env = "PAYLOAD_SIZE", default_value_t = 64)]
    pub payload_size: usize,

    /// Fragments per reply. `1` replies with a single payload; larger values
    /// stream the payload back that many times.
    ///
    /// Environment variable: `STREAM_LEN`
    #[arg(long, env = "STREAM_LEN", default_value_t = 1)]
    pub stream_len: usize,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub backend: Backend,
    pub pool: PoolConfig,
    pub requests: usize,
    pub in_flight: usize,
    pub payload_size: usize,
    pub stream_len: usize,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.in_flight == 0 {
            bail!("IN_FLIGHT must be greater than 0");
        }
        if args.stream_len == 0 {
            bail!("STREAM_LEN must be greater than 0");
        }
        if args.backend == Backend::Shm && args.payload_size > args.shm_size {
            bail!(
                "PAYLOAD_SIZE ({}) exceeds SHM_SIZE ({})",
                args.payload_size,
                args.shm_size
            );
        }

        let pool = PoolConfig::builder()
            .worker_num(args.worker_num)
            .manager_num(args.manager_num)
            .shm_size(args.shm_size)
            .group_name(args.group_name)
            .queue_size(args.queue_size)
            .startup_timeout(Duration::from_secs(args.startup_timeout))
            .log_timing(args.log_timing)
            .build()?;

        Ok(Self {
            backend: args.backend,
            pool,
            requests: args.requests,
            in_flight: args.in_flight,
            payload_size: args.payload_size,
            stream_len: args.stream_len,
        })
    }
}
