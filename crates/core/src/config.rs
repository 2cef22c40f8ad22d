//! 설정 관리: netwarden.toml 파싱 및 런타임 설정
//!
//! [`NetwardenConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`NETWARDEN_WATCH_NETWORK=br0` 형식)
//! 3. 설정 파일 (`netwarden.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), netwarden_core::error::NetwardenError> {
//! use netwarden_core::config::NetwardenConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = NetwardenConfig::load("netwarden.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = NetwardenConfig::parse("[watch]\nnetwork = \"br-app\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, NetwardenError};

/// Netwarden 통합 설정
///
/// `netwarden.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetwardenConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 컨테이너 런타임 연결 설정
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// 감시 대상 설정
    #[serde(default)]
    pub watch: WatchConfig,
    /// 방화벽 규칙 설정
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// 연결 워밍업 설정
    #[serde(default)]
    pub warmup: WarmupConfig,
    /// 시작/종료 스크립트
    #[serde(default)]
    pub scripts: ScriptsConfig,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl NetwardenConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, NetwardenError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 기본값에 환경변수 오버라이드만 적용합니다 (설정 파일 없이 실행할 때).
    pub fn from_env() -> Result<Self, NetwardenError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, NetwardenError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetwardenError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                NetwardenError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, NetwardenError> {
        toml::from_str(toml_str).map_err(|e| {
            NetwardenError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `NETWARDEN_{SECTION}_{FIELD}`
    /// 예: `NETWARDEN_FIREWALL_MARK_PUBLISHED_PORTS=0x1`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "NETWARDEN_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "NETWARDEN_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "NETWARDEN_GENERAL_PID_FILE");

        // Runtime
        override_string(&mut self.runtime.api, "NETWARDEN_RUNTIME_API");
        override_u64(
            &mut self.runtime.reconnect_backoff_secs,
            "NETWARDEN_RUNTIME_RECONNECT_BACKOFF_SECS",
        );

        // Watch
        override_string(&mut self.watch.network, "NETWARDEN_WATCH_NETWORK");
        override_string(&mut self.watch.enable_label, "NETWARDEN_WATCH_ENABLE_LABEL");
        override_usize(
            &mut self.watch.queue_capacity,
            "NETWARDEN_WATCH_QUEUE_CAPACITY",
        );

        // Firewall
        override_string(
            &mut self.firewall.iptables_path,
            "NETWARDEN_FIREWALL_IPTABLES_PATH",
        );
        override_string(
            &mut self.firewall.mark_published_ports,
            "NETWARDEN_FIREWALL_MARK_PUBLISHED_PORTS",
        );
        override_string(
            &mut self.firewall.dnat_ports_label,
            "NETWARDEN_FIREWALL_DNAT_PORTS_LABEL",
        );
        override_u64(
            &mut self.firewall.command_timeout_secs,
            "NETWARDEN_FIREWALL_COMMAND_TIMEOUT_SECS",
        );

        // Warmup
        override_u32(
            &mut self.warmup.max_attempts,
            "NETWARDEN_WARMUP_MAX_ATTEMPTS",
        );
        override_u64(&mut self.warmup.interval_ms, "NETWARDEN_WARMUP_INTERVAL_MS");
        override_u64(
            &mut self.warmup.attempt_timeout_ms,
            "NETWARDEN_WARMUP_ATTEMPT_TIMEOUT_MS",
        );

        // Scripts
        override_string(&mut self.scripts.startup, "NETWARDEN_SCRIPTS_STARTUP");
        override_string(&mut self.scripts.shutdown, "NETWARDEN_SCRIPTS_SHUTDOWN");

        // Metrics
        override_bool(&mut self.metrics.enabled, "NETWARDEN_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "NETWARDEN_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "NETWARDEN_METRICS_PORT");
        override_string(&mut self.metrics.endpoint, "NETWARDEN_METRICS_ENDPOINT");
    }

    /// 설정값의 유효성을 검증합니다.
    ///
    /// 모듈별 범위 검증은 각 모듈 설정(`NetworkGuardConfig` 등)이 담당합니다.
    pub fn validate(&self) -> Result<(), NetwardenError> {
        // log_level 검증
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        // log_format 검증
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.watch.network.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "watch.network".to_owned(),
                reason: "network must not be empty".to_owned(),
            }
            .into());
        }

        if self.watch.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watch.queue_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            }
            .into());
        }

        if self.firewall.iptables_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "firewall.iptables_path".to_owned(),
                reason: "iptables path must not be empty".to_owned(),
            }
            .into());
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "metrics.port".to_owned(),
                reason: "port must be non-zero when metrics are enabled".to_owned(),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 생성하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 컨테이너 런타임 연결 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 런타임 API 주소 (빈 문자열이면 소켓 자동 탐지)
    ///
    /// 소켓 경로, `unix://path`, `http://host:port`, `tcp://host:port`를 받습니다.
    pub api: String,
    /// 이벤트 스트림 재연결 대기 시간 (초)
    pub reconnect_backoff_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api: String::new(),
            reconnect_backoff_secs: 2,
        }
    }
}

/// 감시 대상 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// 감시할 컨테이너 네트워크 이름
    pub network: String,
    /// 활성화 레이블 (값이 "true"인 컨테이너만 대상, 빈 문자열이면 필터 없음)
    pub enable_label: String,
    /// 전이 큐 용량
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            network: "bridge".to_owned(),
            enable_label: "network.enable".to_owned(),
            queue_capacity: 200,
        }
    }
}

/// 방화벽 규칙 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// iptables 실행 파일 경로
    pub iptables_path: String,
    /// 게시 포트에 설정할 mangle 마크 (빈 문자열이면 마크 규칙 없음)
    pub mark_published_ports: String,
    /// DNAT 포트 목록을 담는 레이블 이름 (빈 문자열이면 DNAT 비활성)
    pub dnat_ports_label: String,
    /// iptables 명령 타임아웃 (초)
    pub command_timeout_secs: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables_path: "iptables".to_owned(),
            mark_published_ports: String::new(),
            dnat_ports_label: "network.dnat.ports".to_owned(),
            command_timeout_secs: 30,
        }
    }
}

/// 연결 워밍업 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// 최대 시도 횟수
    pub max_attempts: u32,
    /// 시도 간격 (밀리초)
    pub interval_ms: u64,
    /// 시도별 타임아웃 (밀리초)
    pub attempt_timeout_ms: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_ms: 1000,
            attempt_timeout_ms: 1000,
        }
    }
}

/// 시작/종료 스크립트 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// 가드 시작 전에 실행할 셸 스크립트
    pub startup: String,
    /// 종료 시그널 수신 후 실행할 셸 스크립트
    pub shutdown: String,
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 수신 주소
    pub listen_addr: String,
    /// 수신 포트
    pub port: u16,
    /// 스크레이프 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9102,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = NetwardenConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert!(config.runtime.api.is_empty());
        assert_eq!(config.runtime.reconnect_backoff_secs, 2);
        assert_eq!(config.watch.network, "bridge");
        assert_eq!(config.watch.enable_label, "network.enable");
        assert_eq!(config.watch.queue_capacity, 200);
        assert!(config.firewall.mark_published_ports.is_empty());
        assert_eq!(config.firewall.dnat_ports_label, "network.dnat.ports");
        assert_eq!(config.warmup.max_attempts, 60);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        let config = NetwardenConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = NetwardenConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.watch.network, "bridge");
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[watch]
network = "br-app"

[firewall]
mark_published_ports = "0x100"
"#;
        let config = NetwardenConfig::parse(toml).unwrap();
        assert_eq!(config.watch.network, "br-app");
        // enable_label은 기본값 유지
        assert_eq!(config.watch.enable_label, "network.enable");
        assert_eq!(config.firewall.mark_published_ports, "0x100");
        assert_eq!(config.firewall.iptables_path, "iptables");
    }

    #[test]
    fn from_str_full_toml() {
        let toml = r#"
[general]
log_level = "debug"
log_format = "pretty"
pid_file = "/run/netwarden.pid"

[runtime]
api = "unix:///run/podman/podman.sock"
reconnect_backoff_secs = 5

[watch]
network = "edge"
enable_label = ""
queue_capacity = 50

[firewall]
iptables_path = "/usr/sbin/iptables-legacy"
mark_published_ports = "0x1/0xff"
dnat_ports_label = "edge.dnat"
command_timeout_secs = 10

[warmup]
max_attempts = 5
interval_ms = 200
attempt_timeout_ms = 300

[scripts]
startup = "echo up"
shutdown = "echo down"

[metrics]
enabled = true
listen_addr = "0.0.0.0"
port = 9200
endpoint = "/metrics"
"#;
        let config = NetwardenConfig::parse(toml).unwrap();
        assert_eq!(config.general.log_format, "pretty");
        assert_eq!(config.runtime.reconnect_backoff_secs, 5);
        assert!(config.watch.enable_label.is_empty());
        assert_eq!(config.watch.queue_capacity, 50);
        assert_eq!(config.firewall.iptables_path, "/usr/sbin/iptables-legacy");
        assert_eq!(config.warmup.interval_ms, 200);
        assert_eq!(config.scripts.shutdown, "echo down");
        assert_eq!(config.metrics.port, 9200);
        config.validate().unwrap();
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let result = NetwardenConfig::parse("invalid = [[[toml");
        assert!(matches!(
            result.unwrap_err(),
            NetwardenError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = NetwardenConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = NetwardenConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_empty_network() {
        let mut config = NetwardenConfig::default();
        config.watch.network = "  ".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watch.network"));
    }

    #[test]
    fn validate_rejects_zero_queue_capacity() {
        let mut config = NetwardenConfig::default();
        config.watch.queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn validate_rejects_zero_metrics_port_when_enabled() {
        let mut config = NetwardenConfig::default();
        config.metrics.enabled = true;
        config.metrics.port = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metrics.port"));
    }

    #[test]
    fn validate_accepts_zero_metrics_port_when_disabled() {
        let mut config = NetwardenConfig::default();
        config.metrics.port = 0;
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: serial_test로 직렬화되어 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe { std::env::set_var("TEST_NETWARDEN_STR", "overridden") };
        override_string(&mut val, "TEST_NETWARDEN_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_NETWARDEN_STR") };
    }

    #[test]
    #[serial]
    fn env_override_bool_invalid_keeps_original() {
        let mut val = false;
        // SAFETY: serial_test로 직렬화되어 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe { std::env::set_var("TEST_NETWARDEN_BOOL_BAD", "not-a-bool") };
        override_bool(&mut val, "TEST_NETWARDEN_BOOL_BAD");
        assert!(!val); // 원래 값 유지
        unsafe { std::env::remove_var("TEST_NETWARDEN_BOOL_BAD") };
    }

    #[test]
    #[serial]
    fn env_override_u16_out_of_range_keeps_original() {
        let mut val = 9102u16;
        // SAFETY: serial_test로 직렬화되어 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe { std::env::set_var("TEST_NETWARDEN_U16", "70000") };
        override_u16(&mut val, "TEST_NETWARDEN_U16");
        assert_eq!(val, 9102);
        unsafe { std::env::remove_var("TEST_NETWARDEN_U16") };
    }

    #[test]
    #[serial]
    fn apply_env_overrides_updates_sections() {
        // SAFETY: serial_test로 직렬화되어 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe {
            std::env::set_var("NETWARDEN_WATCH_NETWORK", "br-env");
            std::env::set_var("NETWARDEN_FIREWALL_MARK_PUBLISHED_PORTS", "0x2");
            std::env::set_var("NETWARDEN_WARMUP_MAX_ATTEMPTS", "3");
        }
        let mut config = NetwardenConfig::default();
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("NETWARDEN_WATCH_NETWORK");
            std::env::remove_var("NETWARDEN_FIREWALL_MARK_PUBLISHED_PORTS");
            std::env::remove_var("NETWARDEN_WARMUP_MAX_ATTEMPTS");
        }
        assert_eq!(config.watch.network, "br-env");
        assert_eq!(config.firewall.mark_published_ports, "0x2");
        assert_eq!(config.warmup.max_attempts, 3);
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_NETWARDEN_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = NetwardenConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = NetwardenConfig::parse(&toml_str).unwrap();
        assert_eq!(config.watch.network, parsed.watch.network);
        assert_eq!(config.warmup.interval_ms, parsed.warmup.interval_ms);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let result = NetwardenConfig::from_file("/nonexistent/path/netwarden.toml").await;
        assert!(matches!(
            result.unwrap_err(),
            NetwardenError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
