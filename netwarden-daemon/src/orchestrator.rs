//! Daemon assembly and lifecycle management.
//!
//! The [`Orchestrator`] wires the production runtime client, iptables
//! executor and prober into a `NetworkGuard` and drives it through one
//! daemon lifetime.
//!
//! # Startup
//!
//! 1. PID file
//! 2. startup script (nonzero exit aborts)
//! 3. guard start (startup discovery, then event subscription)
//!
//! # Shutdown
//!
//! 1. SIGTERM / SIGINT
//! 2. cancellation broadcast to tracker, reconciler and warm-ups
//! 3. shutdown script
//! 4. guard stop (waits for in-flight handlers up to the grace period)
//! 5. PID file removal

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use netwarden_core::config::NetwardenConfig;
use netwarden_core::pipeline::Pipeline;
use netwarden_network_guard::{
    BollardRuntimeClient, IptablesExecutor, NetProber, NetworkGuard, NetworkGuardBuilder,
    NetworkGuardConfig,
};

use crate::{metrics_server, scripts};

/// The guard as assembled for production.
pub type ProductionGuard = NetworkGuard<BollardRuntimeClient, IptablesExecutor, NetProber>;

const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: NetwardenConfig,
    guard: ProductionGuard,
    /// Root cancellation token shared with the guard.
    shutdown: CancellationToken,
    start_time: Instant,
}

impl Orchestrator {
    /// Build the orchestrator from an already merged configuration.
    ///
    /// Installs the metrics recorder when `[metrics]` is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the runtime
    /// client cannot be created, or the metrics recorder fails to install.
    pub fn build_from_config(config: NetwardenConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

        let guard_config = NetworkGuardConfig::from_core(&config);
        guard_config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid network guard configuration: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            record_daemon_metrics();
        }

        let runtime = BollardRuntimeClient::connect(&guard_config.runtime_api)
            .map_err(|e| anyhow::anyhow!("failed to create runtime client: {}", e))?;
        tracing::info!(endpoint = %runtime.endpoint(), "runtime client created");

        let executor = IptablesExecutor::new(
            guard_config.iptables_path.clone(),
            guard_config.command_timeout(),
        );
        let prober = NetProber::new(guard_config.warmup_policy().attempt_timeout);

        let shutdown = CancellationToken::new();
        let guard = NetworkGuardBuilder::new()
            .config(guard_config)
            .runtime(Arc::new(runtime))
            .executor(Arc::new(executor))
            .prober(Arc::new(prober))
            .cancellation_token(shutdown.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build network guard: {}", e))?;

        tracing::info!(
            network = %config.watch.network,
            enable_label = %config.watch.enable_label,
            dnat_ports_label = %config.firewall.dnat_ports_label,
            mark = %config.firewall.mark_published_ports,
            "network guard initialized"
        );

        Ok(Self {
            config,
            guard,
            shutdown,
            start_time: Instant::now(),
        })
    }

    /// Run the daemon until SIGTERM or SIGINT, then shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be written, the startup
    /// script fails, or the guard fails to start.
    pub async fn run(&mut self) -> Result<()> {
        let pid_file = (!self.config.general.pid_file.is_empty())
            .then(|| PathBuf::from(&self.config.general.pid_file));
        let pid_file = pid_file.as_deref();
        if let Some(path) = pid_file {
            write_pid_file(path)?;
        }

        let started = self.start().await;
        if let Err(e) = started {
            self.shutdown.cancel();
            if let Some(path) = pid_file {
                remove_pid_file(path);
            }
            return Err(e);
        }

        let uptime_task = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, self.shutdown.clone()));

        tracing::info!("netwarden-daemon running");
        let signal = wait_for_shutdown_signal().await;
        match &signal {
            Ok(name) => tracing::info!(signal = name, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "signal handling failed, shutting down"),
        }

        tracing::info!("broadcasting cancellation");
        self.shutdown.cancel();

        scripts::run_shutdown_script(&self.config.scripts.shutdown).await;

        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        let stopped = self.guard.stop().await;
        if let Err(e) = &stopped {
            tracing::error!(error = %e, "failed to stop network guard");
        }

        if let Some(path) = pid_file {
            remove_pid_file(path);
        }

        tracing::info!(uptime_secs = self.uptime_secs(), "netwarden-daemon stopped");
        signal?;
        stopped.map_err(|e| anyhow::anyhow!("failed to stop network guard: {}", e))
    }

    async fn start(&mut self) -> Result<()> {
        scripts::run_startup_script(&self.config.scripts.startup).await?;

        self.guard
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start network guard: {}", e))?;
        tracing::info!(
            containers = self.guard.container_count().await,
            "network guard started"
        );
        Ok(())
    }

    /// Seconds since the orchestrator was built.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &NetwardenConfig {
        &self.config
    }

    /// The assembled guard.
    pub fn guard(&self) -> &ProductionGuard {
        &self.guard
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to `path`.
///
/// The file is created with `create_new` so a second instance fails instead
/// of overwriting it, checked to be a regular file, and restricted to 0o600.
/// Missing parent directories are created with 0o700.
///
/// # Errors
///
/// Returns an error if the file already exists or cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another netwarden instance running?",
                path.display(),
                existing.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    let pid = std::process::id();
    writeln!(file, "{}", pid)?;

    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file. Failure is logged, never returned.
pub fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "PID file removed"),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove PID file"
        ),
    }
}

fn record_daemon_metrics() {
    use netwarden_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Periodically publish the uptime gauge until `shutdown` is cancelled.
fn spawn_uptime_updater(
    start_time: Instant,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    use netwarden_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
