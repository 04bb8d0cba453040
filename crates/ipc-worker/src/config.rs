use crate::error::{Error, Result};
use core::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default byte capacity of a shared-memory worker segment (1 MiB).
pub const DEFAULT_SHM_SIZE: usize = 1024 * 1024;

/// Default capacity of the bounded input/output channels.
pub const DEFAULT_QUEUE_SIZE: usize = 20;

/// Default time allowed for roles to publish addresses and readiness.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Construction options shared by both pool backends.
///
/// Options that only apply to one backend (`manager_num`, `shm_size`) are
/// ignored by the other. Every pool gets its own quit token unless one is
/// supplied explicitly, so independent pools never share shutdown state.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker roles.
    pub worker_num: usize,
    /// Number of dispatch managers (shared-memory backend only).
    pub manager_num: usize,
    /// Byte capacity of each worker segment (shared-memory backend only).
    pub shm_size: usize,
    /// Prefix for every role, segment and identity name of the pool.
    pub group_name: Arc<str>,
    /// Capacity of the bounded input and output channels.
    pub queue_size: usize,
    /// Log the duration and payload size of every handled request.
    pub log_timing: bool,
    /// Terminate all roles when the pool handle is dropped.
    pub daemon: bool,
    /// Bound on address and readiness handshakes during `start`.
    pub startup_timeout: Duration,
    /// Quit signal observed by every role of the pool.
    pub quit: CancellationToken,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_num: 1,
            manager_num: 1,
            shm_size: DEFAULT_SHM_SIZE,
            group_name: Arc::from("ipc"),
            queue_size: DEFAULT_QUEUE_SIZE,
            log_timing: false,
            daemon: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            quit: CancellationToken::new(),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Rejects configurations no pool can run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any count or capacity is zero or
    /// the group name is empty.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.worker_num == 0 {
            "worker_num must be greater than 0"
        } else if self.manager_num == 0 {
            "manager_num must be greater than 0"
        } else if self.queue_size == 0 {
            "queue_size must be greater than 0"
        } else if self.shm_size == 0 {
            "shm_size must be greater than 0"
        } else if self.group_name.is_empty() {
            "group_name must not be empty"
        } else {
            return Ok(());
        };
        Err(Error::InvalidConfig {
            reason: reason.to_string(),
        })
    }
}

/// Builder for [`PoolConfig`]. Unset fields keep their defaults.
#[derive(Default, Debug)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn worker_num(mut self, worker_num: usize) -> Self {
        self.config.worker_num = worker_num;
        self
    }

    pub fn manager_num(mut self, manager_num: usize) -> Self {
        self.config.manager_num = manager_num;
        self
    }

    pub fn shm_size(mut self, shm_size: usize) -> Self {
        self.config.shm_size = shm_size;
        self
    }

    pub fn group_name(mut self, group_name: impl Into<Arc<str>>) -> Self {
        self.config.group_name = group_name.into();
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.config.queue_size = queue_size;
        self
    }

    pub fn log_timing(mut self, log_timing: bool) -> Self {
        self.config.log_timing = log_timing;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    pub fn startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.config.startup_timeout = startup_timeout;
        self
    }

    pub fn quit(mut self, quit: CancellationToken) -> Self {
        self.config.quit = quit;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// See [`PoolConfig::validate`].
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PoolConfig::builder().build().unwrap();
        assert_eq!(config.worker_num, 1);
        assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(config.shm_size, DEFAULT_SHM_SIZE);
        assert_eq!(&*config.group_name, "ipc");
    }

    #[test]
    fn zero_workers_rejected() {
        let err = PoolConfig::builder().worker_num(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn empty_group_rejected() {
        let err = PoolConfig::builder().group_name("").build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn each_pool_gets_its_own_quit_token() {
        let a = PoolConfig::default();
        let b = PoolConfig::default();
        a.quit.cancel();
        assert!(!b.quit.is_cancelled());
    }
}
