//! 네트워크 가드 설정
//!
//! [`NetworkGuardConfig`]는 core의 [`NetwardenConfig`](netwarden_core::config::NetwardenConfig)
//! 여러 섹션(runtime, watch, firewall, warmup)을 모아 가드 전용 설정을 제공합니다.
//!
//! # 사용 예시
//! ```ignore
//! use netwarden_core::config::NetwardenConfig;
//! use netwarden_network_guard::config::NetworkGuardConfig;
//!
//! let core_config = NetwardenConfig::default();
//! let config = NetworkGuardConfig::from_core(&core_config);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use netwarden_core::config::NetwardenConfig;

use crate::error::NetworkGuardError;
use crate::warmup::WarmupPolicy;

/// 네트워크 가드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkGuardConfig {
    /// 런타임 API 주소 (빈 문자열이면 자동 탐지)
    pub runtime_api: String,
    /// 이벤트 스트림 재연결 대기 시간 (초)
    pub reconnect_backoff_secs: u64,
    /// 감시 네트워크 이름
    pub network: String,
    /// 활성화 레이블 (빈 문자열이면 필터 없음)
    pub enable_label: String,
    /// 전이 큐 용량
    pub queue_capacity: usize,
    /// iptables 실행 파일
    pub iptables_path: String,
    /// 게시 포트 mangle 마크 (빈 문자열이면 마크 규칙 없음)
    pub mark_published_ports: String,
    /// DNAT 포트 레이블 이름 (빈 문자열이면 DNAT 없음)
    pub dnat_ports_label: String,
    /// iptables 명령 타임아웃 (초)
    pub command_timeout_secs: u64,
    /// 워밍업 최대 시도 횟수
    pub warmup_max_attempts: u32,
    /// 워밍업 시도 간격 (밀리초)
    pub warmup_interval_ms: u64,
    /// 워밍업 시도별 타임아웃 (밀리초)
    pub warmup_attempt_timeout_ms: u64,

    // --- 확장 설정 (core에 없는 추가 필드) ---
    /// 정지 시 진행 중인 핸들러를 기다리는 최대 시간 (초)
    pub shutdown_grace_secs: u64,
}

impl Default for NetworkGuardConfig {
    fn default() -> Self {
        Self {
            runtime_api: String::new(),
            reconnect_backoff_secs: 2,
            network: "bridge".to_owned(),
            enable_label: "network.enable".to_owned(),
            queue_capacity: 200,
            iptables_path: "iptables".to_owned(),
            mark_published_ports: String::new(),
            dnat_ports_label: "network.dnat.ports".to_owned(),
            command_timeout_secs: 30,
            warmup_max_attempts: 60,
            warmup_interval_ms: 1000,
            warmup_attempt_timeout_ms: 1000,
            shutdown_grace_secs: 5,
        }
    }
}

/// 설정 상한값 상수
const MAX_QUEUE_CAPACITY: usize = 10_000;
const MAX_RECONNECT_BACKOFF_SECS: u64 = 300;
const MAX_WARMUP_ATTEMPTS: u32 = 600;
const MAX_WARMUP_MS: u64 = 60_000;
const MAX_COMMAND_TIMEOUT_SECS: u64 = 300;
const MAX_SHUTDOWN_GRACE_SECS: u64 = 120;

impl NetworkGuardConfig {
    /// core 통합 설정에서 가드 설정을 생성합니다.
    ///
    /// core 설정에 없는 확장 필드는 기본값이 적용됩니다.
    pub fn from_core(core: &NetwardenConfig) -> Self {
        Self {
            runtime_api: core.runtime.api.clone(),
            reconnect_backoff_secs: core.runtime.reconnect_backoff_secs,
            network: core.watch.network.clone(),
            enable_label: core.watch.enable_label.clone(),
            queue_capacity: core.watch.queue_capacity,
            iptables_path: core.firewall.iptables_path.clone(),
            mark_published_ports: core.firewall.mark_published_ports.clone(),
            dnat_ports_label: core.firewall.dnat_ports_label.clone(),
            command_timeout_secs: core.firewall.command_timeout_secs,
            warmup_max_attempts: core.warmup.max_attempts,
            warmup_interval_ms: core.warmup.interval_ms,
            warmup_attempt_timeout_ms: core.warmup.attempt_timeout_ms,
            ..Self::default()
        }
    }

    /// 설정된 활성화 레이블 (비어 있으면 None)
    pub fn enable_label(&self) -> Option<&str> {
        non_empty(&self.enable_label)
    }

    /// 설정된 mangle 마크 값 (비어 있으면 None)
    pub fn mark(&self) -> Option<&str> {
        non_empty(&self.mark_published_ports)
    }

    /// 설정된 DNAT 레이블 이름 (비어 있으면 None)
    pub fn dnat_label(&self) -> Option<&str> {
        non_empty(&self.dnat_ports_label)
    }

    /// 재연결 대기 시간
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// iptables 명령 타임아웃
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// 정지 유예 시간
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// 워밍업 재시도 정책
    pub fn warmup_policy(&self) -> WarmupPolicy {
        WarmupPolicy {
            max_attempts: self.warmup_max_attempts,
            interval: Duration::from_millis(self.warmup_interval_ms),
            attempt_timeout: Duration::from_millis(self.warmup_attempt_timeout_ms),
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), NetworkGuardError> {
        if self.network.trim().is_empty() {
            return Err(NetworkGuardError::Config {
                field: "network".to_owned(),
                reason: "watched network must not be empty".to_owned(),
            });
        }

        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(NetworkGuardError::Config {
                field: "queue_capacity".to_owned(),
                reason: format!("must be 1-{MAX_QUEUE_CAPACITY}"),
            });
        }

        if self.reconnect_backoff_secs == 0
            || self.reconnect_backoff_secs > MAX_RECONNECT_BACKOFF_SECS
        {
            return Err(NetworkGuardError::Config {
                field: "reconnect_backoff_secs".to_owned(),
                reason: format!("must be 1-{MAX_RECONNECT_BACKOFF_SECS}"),
            });
        }

        if self.warmup_max_attempts == 0 || self.warmup_max_attempts > MAX_WARMUP_ATTEMPTS {
            return Err(NetworkGuardError::Config {
                field: "warmup_max_attempts".to_owned(),
                reason: format!("must be 1-{MAX_WARMUP_ATTEMPTS}"),
            });
        }

        for (field, value) in [
            ("warmup_interval_ms", self.warmup_interval_ms),
            ("warmup_attempt_timeout_ms", self.warmup_attempt_timeout_ms),
        ] {
            if value == 0 || value > MAX_WARMUP_MS {
                return Err(NetworkGuardError::Config {
                    field: field.to_owned(),
                    reason: format!("must be 1-{MAX_WARMUP_MS}"),
                });
            }
        }

        if self.command_timeout_secs == 0 || self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS
        {
            return Err(NetworkGuardError::Config {
                field: "command_timeout_secs".to_owned(),
                reason: format!("must be 1-{MAX_COMMAND_TIMEOUT_SECS}"),
            });
        }

        if self.shutdown_grace_secs > MAX_SHUTDOWN_GRACE_SECS {
            return Err(NetworkGuardError::Config {
                field: "shutdown_grace_secs".to_owned(),
                reason: format!("must be 0-{MAX_SHUTDOWN_GRACE_SECS}"),
            });
        }

        if self.iptables_path.trim().is_empty() {
            return Err(NetworkGuardError::Config {
                field: "iptables_path".to_owned(),
                reason: "iptables path must not be empty".to_owned(),
            });
        }

        if let Some(mark) = self.mark() {
            if !is_valid_mark(mark) {
                return Err(NetworkGuardError::Config {
                    field: "mark_published_ports".to_owned(),
                    reason: format!("'{mark}' is not a mark value (expected value or value/mask)"),
                });
            }
        }

        Ok(())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// `value` 또는 `value/mask` 형식(10진수 또는 0x 16진수)인지 확인합니다.
fn is_valid_mark(mark: &str) -> bool {
    let mut parts = mark.splitn(2, '/');
    let value_ok = parts.next().is_some_and(is_mark_number);
    let mask_ok = parts.next().is_none_or(is_mark_number);
    value_ok && mask_ok
}

/// 마크 값은 32비트이므로 u32 범위를 넘으면 거부합니다.
fn is_mark_number(s: &str) -> bool {
    // from_str_radix는 선행 '+'를 허용하므로 문자 검사를 먼저 수행
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit())
            && u32::from_str_radix(hex, 16).is_ok()
    } else {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) && s.parse::<u32>().is_ok()
    }
}

/// 네트워크 가드 설정 빌더
#[derive(Default)]
pub struct NetworkGuardConfigBuilder {
    config: NetworkGuardConfig,
}

impl NetworkGuardConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 런타임 API 주소를 설정합니다.
    pub fn runtime_api(mut self, api: impl Into<String>) -> Self {
        self.config.runtime_api = api.into();
        self
    }

    /// 재연결 대기 시간(초)을 설정합니다.
    pub fn reconnect_backoff_secs(mut self, secs: u64) -> Self {
        self.config.reconnect_backoff_secs = secs;
        self
    }

    /// 감시 네트워크를 설정합니다.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.config.network = network.into();
        self
    }

    /// 활성화 레이블을 설정합니다.
    pub fn enable_label(mut self, label: impl Into<String>) -> Self {
        self.config.enable_label = label.into();
        self
    }

    /// 전이 큐 용량을 설정합니다.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// iptables 실행 파일을 설정합니다.
    pub fn iptables_path(mut self, path: impl Into<String>) -> Self {
        self.config.iptables_path = path.into();
        self
    }

    /// 게시 포트 마크 값을 설정합니다.
    pub fn mark_published_ports(mut self, mark: impl Into<String>) -> Self {
        self.config.mark_published_ports = mark.into();
        self
    }

    /// DNAT 포트 레이블 이름을 설정합니다.
    pub fn dnat_ports_label(mut self, label: impl Into<String>) -> Self {
        self.config.dnat_ports_label = label.into();
        self
    }

    /// iptables 명령 타임아웃(초)을 설정합니다.
    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.config.command_timeout_secs = secs;
        self
    }

    /// 워밍업 정책을 설정합니다.
    pub fn warmup(mut self, max_attempts: u32, interval_ms: u64, attempt_timeout_ms: u64) -> Self {
        self.config.warmup_max_attempts = max_attempts;
        self.config.warmup_interval_ms = interval_ms;
        self.config.warmup_attempt_timeout_ms = attempt_timeout_ms;
        self
    }

    /// 정지 유예 시간(초)을 설정합니다.
    pub fn shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.config.shutdown_grace_secs = secs;
        self
    }

    /// 설정을 빌드합니다. 유효성 검증을 수행합니다.
    pub fn build(self) -> Result<NetworkGuardConfig, NetworkGuardError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        NetworkGuardConfig::default().validate().unwrap();
    }

    #[test]
    fn from_core_copies_sections() {
        let mut core = NetwardenConfig::default();
        core.runtime.api = "unix:///run/podman/podman.sock".to_owned();
        core.watch.network = "edge".to_owned();
        core.firewall.mark_published_ports = "0x1".to_owned();
        core.warmup.max_attempts = 7;

        let config = NetworkGuardConfig::from_core(&core);
        assert_eq!(config.runtime_api, "unix:///run/podman/podman.sock");
        assert_eq!(config.network, "edge");
        assert_eq!(config.mark(), Some("0x1"));
        assert_eq!(config.warmup_max_attempts, 7);
        // 확장 필드는 기본값
        assert_eq!(config.shutdown_grace_secs, 5);
    }

    #[test]
    fn empty_optional_fields_become_none() {
        let config = NetworkGuardConfig {
            enable_label: String::new(),
            mark_published_ports: "  ".to_owned(),
            dnat_ports_label: String::new(),
            ..Default::default()
        };
        assert_eq!(config.enable_label(), None);
        assert_eq!(config.mark(), None);
        assert_eq!(config.dnat_label(), None);
    }

    #[test]
    fn warmup_policy_uses_millis() {
        let config = NetworkGuardConfig {
            warmup_max_attempts: 3,
            warmup_interval_ms: 250,
            warmup_attempt_timeout_ms: 100,
            ..Default::default()
        };
        let policy = config.warmup_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.attempt_timeout, Duration::from_millis(100));
    }

    #[test]
    fn validate_rejects_zero_queue_capacity() {
        let config = NetworkGuardConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn validate_rejects_excessive_queue_capacity() {
        let config = NetworkGuardConfig {
            queue_capacity: MAX_QUEUE_CAPACITY + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_backoff() {
        let config = NetworkGuardConfig {
            reconnect_backoff_secs: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_backoff_secs"));
    }

    #[test]
    fn validate_rejects_zero_warmup_interval() {
        let config = NetworkGuardConfig {
            warmup_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("warmup_interval_ms"));
    }

    #[test]
    fn validate_rejects_empty_network() {
        let config = NetworkGuardConfig {
            network: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn mark_formats() {
        for ok in ["1", "0x1", "0xFF/0xff", "256/65535", "0X10"] {
            assert!(is_valid_mark(ok), "{ok} should be accepted");
        }
        for bad in ["0x", "abc", "1/", "/1", "0xzz", "1/2/3", "-1"] {
            assert!(!is_valid_mark(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn mark_rejects_values_beyond_u32() {
        assert!(is_valid_mark("0xffffffff"));
        assert!(is_valid_mark("4294967295/0xffffffff"));
        for bad in ["0x100000000", "4294967296", "1/0x100000000", "+1", "0x+1"] {
            assert!(!is_valid_mark(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_bad_mark() {
        let config = NetworkGuardConfig {
            mark_published_ports: "mark-me".to_owned(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mark_published_ports"));
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = NetworkGuardConfigBuilder::new()
            .network("br-app")
            .enable_label("")
            .mark_published_ports("0x2")
            .warmup(5, 100, 100)
            .queue_capacity(16)
            .build()
            .unwrap();
        assert_eq!(config.network, "br-app");
        assert_eq!(config.enable_label(), None);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.warmup_max_attempts, 5);
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let result = NetworkGuardConfigBuilder::new()
            .command_timeout_secs(0)
            .build();
        assert!(result.is_err());
    }
}
