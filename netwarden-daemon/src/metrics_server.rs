//! Prometheus metrics HTTP server.
//!
//! Uses the built-in HTTP listener from `metrics-exporter-prometheus`.
//! Once installed, every `metrics::counter!()`, `gauge!()` and
//! `histogram!()` call in the workspace lands in the scrape output.

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use netwarden_core::config::MetricsConfig;
use netwarden_core::metrics as m;

/// Parse `listen_addr:port` into a socket address.
///
/// IPv6 literals may be given with or without brackets.
pub fn listen_socket(config: &MetricsConfig) -> Result<SocketAddr> {
    let host = config.listen_addr.trim();
    let raw = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, config.port)
    } else {
        format!("{}:{}", host, config.port)
    };
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address '{}': {}", raw, e))
}

/// Install the global metrics recorder and start the HTTP listener.
///
/// Call once per process.
///
/// # Errors
///
/// - the endpoint is not `/metrics`
/// - the listen address does not parse
/// - socket binding fails or a recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    if config.endpoint != "/metrics" {
        return Err(anyhow::anyhow!(
            "unsupported metrics endpoint '{}': only '/metrics' is currently supported",
            config.endpoint
        ));
    }

    let addr = listen_socket(config)?;
    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces; it reveals container counts and rule activity"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(m::RECONCILER_WARMUP_DURATION_SECONDS.to_owned()),
            &m::WARMUP_DURATION_BUCKETS,
        )
        .map_err(|e| anyhow::anyhow!("invalid warm-up histogram buckets: {}", e))?
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    m::describe_all();

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(listen_addr: &str, port: u16) -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            listen_addr: listen_addr.to_owned(),
            port,
            endpoint: "/metrics".to_owned(),
        }
    }

    #[test]
    fn listen_socket_ipv4() {
        let addr = listen_socket(&config("127.0.0.1", 9102)).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9102");
    }

    #[test]
    fn listen_socket_ipv6_without_brackets() {
        let addr = listen_socket(&config("::1", 9102)).unwrap();
        assert_eq!(addr.to_string(), "[::1]:9102");
    }

    #[test]
    fn listen_socket_ipv6_with_brackets() {
        let addr = listen_socket(&config("[::]", 9000)).unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn listen_socket_rejects_hostname() {
        assert!(listen_socket(&config("metrics.local", 9102)).is_err());
    }
}
