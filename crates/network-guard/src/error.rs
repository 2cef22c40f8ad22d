//! 네트워크 가드 에러 타입
//!
//! [`NetworkGuardError`]는 네트워크 가드 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<NetworkGuardError> for NetwardenError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use netwarden_core::error::{FirewallError, NetwardenError, PipelineError, RuntimeError};

/// 네트워크 가드 도메인 에러
///
/// 런타임 API 호출, 이벤트 스트림, iptables 실행, 포트 명세 파싱, 설정 에러 등
/// 네트워크 가드 내부의 모든 에러 상황을 포괄합니다.
#[derive(Debug, thiserror::Error)]
pub enum NetworkGuardError {
    /// 런타임 API 호출 실패
    #[error("runtime api error: {0}")]
    RuntimeApi(String),

    /// 런타임 소켓 연결 실패
    #[error("runtime connection error: {0}")]
    RuntimeConnection(String),

    /// 이벤트 스트림 I/O 실패 (재연결 대상)
    #[error("event stream error: {0}")]
    EventStream(String),

    /// 개별 이벤트 디코딩 실패 (건너뜀)
    #[error("event decode error: {0}")]
    EventDecode(String),

    /// 컨테이너를 찾을 수 없음
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// iptables 규칙 실행 실패
    #[error("rule failed: {rule}: {reason}")]
    RuleFailed {
        /// 규칙 설명 (테이블/체인/포트)
        rule: String,
        /// 실패 사유
        reason: String,
    },

    /// 잘못된 포트 토큰
    #[error("invalid port token '{token}': {reason}")]
    InvalidPort {
        /// 원본 토큰
        token: String,
        /// 거부 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<NetworkGuardError> for NetwardenError {
    fn from(err: NetworkGuardError) -> Self {
        match err {
            NetworkGuardError::RuntimeApi(msg) => NetwardenError::Runtime(RuntimeError::Api(msg)),
            NetworkGuardError::RuntimeConnection(msg) => {
                NetwardenError::Runtime(RuntimeError::Connection(msg))
            }
            NetworkGuardError::EventStream(msg) | NetworkGuardError::EventDecode(msg) => {
                NetwardenError::Runtime(RuntimeError::Stream(msg))
            }
            NetworkGuardError::ContainerNotFound(id) => {
                NetwardenError::Runtime(RuntimeError::NotFound(id))
            }
            NetworkGuardError::RuleFailed { rule, reason } => {
                NetwardenError::Firewall(FirewallError::RuleFailed { rule, reason })
            }
            NetworkGuardError::InvalidPort { token, reason } => {
                NetwardenError::Firewall(FirewallError::InvalidPort { token, reason })
            }
            NetworkGuardError::Config { field, reason } => {
                NetwardenError::Config(netwarden_core::error::ConfigError::InvalidValue {
                    field,
                    reason,
                })
            }
            NetworkGuardError::Channel(msg) => {
                NetwardenError::Pipeline(PipelineError::ChannelSend(msg))
            }
        }
    }
}
