//! CLI argument definitions for netwarden-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments. The
//! watch/firewall/script flags also read the short environment names
//! deployments already use (`WATCH_NETWORK`, `RUNTIME_API`, ...).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use netwarden_core::config::NetwardenConfig;

/// Netwarden container network firewall sync daemon.
///
/// Tracks container lifecycle on one runtime network and keeps host
/// iptables DNAT/FORWARD/MARK rules in sync with it.
#[derive(Parser, Debug, Default)]
#[command(name = "netwarden-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to netwarden.toml configuration file.
    ///
    /// Without it, built-in defaults plus environment overrides are used.
    #[arg(short, long, env = "NETWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path.
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Container runtime API endpoint (`unix:///run/docker.sock`, `tcp://host:2375`).
    ///
    /// Empty means auto-detect the Docker or Podman socket.
    #[arg(long, env = "RUNTIME_API")]
    pub runtime_api: Option<String>,

    /// Runtime network whose containers are tracked.
    #[arg(long, env = "WATCH_NETWORK")]
    pub watch_network: Option<String>,

    /// Label that must be `true` on tracked containers (empty disables the check).
    #[arg(long, env = "WATCH_CONTAINER_LABEL")]
    pub watch_container_label: Option<String>,

    /// Mangle mark for published ports that are not DNAT targets (empty disables marking).
    #[arg(long, env = "IPTABLES_MANGLE_MARK_PUBLISHED_PORTS")]
    pub iptables_mangle_mark_published_ports: Option<String>,

    /// Container label holding the DNAT port list.
    #[arg(long, env = "IPTABLES_DNAT_PORTS_LABEL")]
    pub iptables_dnat_ports_label: Option<String>,

    /// Shell script run before the guard starts.
    #[arg(long, env = "STARTUP_SCRIPT")]
    pub startup_script: Option<String>,

    /// Shell script run after the shutdown signal.
    #[arg(long, env = "SHUTDOWN_SCRIPT")]
    pub shutdown_script: Option<String>,
}

impl DaemonCli {
    /// Merge defaults, the config file, `NETWARDEN_*` variables and flags,
    /// in that order of precedence, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    pub async fn load_config(&self) -> Result<NetwardenConfig> {
        let mut config = match &self.config {
            Some(path) => NetwardenConfig::from_file(path).await.map_err(|e| {
                anyhow::anyhow!("failed to load config {}: {}", path.display(), e)
            })?,
            None => NetwardenConfig::default(),
        };

        config.apply_env_overrides();
        self.apply_to(&mut config);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        Ok(config)
    }

    /// Apply flag values on top of an already loaded configuration.
    ///
    /// Flags take precedence over the config file and `NETWARDEN_*` variables.
    pub fn apply_to(&self, config: &mut NetwardenConfig) {
        let overrides: [(&Option<String>, &mut String); 10] = [
            (&self.log_level, &mut config.general.log_level),
            (&self.log_format, &mut config.general.log_format),
            (&self.pid_file, &mut config.general.pid_file),
            (&self.runtime_api, &mut config.runtime.api),
            (&self.watch_network, &mut config.watch.network),
            (&self.watch_container_label, &mut config.watch.enable_label),
            (
                &self.iptables_mangle_mark_published_ports,
                &mut config.firewall.mark_published_ports,
            ),
            (
                &self.iptables_dnat_ports_label,
                &mut config.firewall.dnat_ports_label,
            ),
            (&self.startup_script, &mut config.scripts.startup),
            (&self.shutdown_script, &mut config.scripts.shutdown),
        ];

        for (flag, field) in overrides {
            if let Some(value) = flag {
                field.clone_from(value);
            }
        }
    }
}
