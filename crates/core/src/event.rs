//! 이벤트 시스템: 상태 추적기와 정책 조정기 사이의 메시지
//!
//! [`EventMetadata`]는 모든 이벤트에 공통으로 포함되는 메타데이터이며,
//! [`Event`] trait은 모든 이벤트 타입이 구현해야 하는 인터페이스입니다.
//! [`NetworkTransition`]은 큐를 통해 값으로 전달되는 불변 이벤트입니다.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::ContainerRecord;

// --- 모듈명 상수 ---

/// 상태 추적기 모듈명
pub const MODULE_STATE_TRACKER: &str = "state-tracker";

// --- 이벤트 타입 상수 ---

/// 네트워크 전이 이벤트 타입
pub const EVENT_TYPE_TRANSITION: &str = "transition";

/// 이벤트 메타데이터: 모든 이벤트에 공통으로 포함되는 추적 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 이벤트 생성 시각
    pub timestamp: SystemTime,
    /// 이벤트를 생성한 모듈명
    pub source_module: String,
    /// 추적 ID: 같은 흐름의 로그를 연결합니다
    pub trace_id: String,
}

impl EventMetadata {
    /// 새로운 UUID v4 trace_id를 생성하여 메타데이터를 만듭니다.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] source={} trace={}",
            unix_timestamp_str(self.timestamp),
            self.source_module,
            self.trace_id,
        )
    }
}

/// 모든 이벤트가 구현해야 하는 기본 trait
///
/// `Send + Sync + 'static` 바운드로 `tokio::mpsc` 채널을 통한
/// 안전한 전송을 보장합니다.
pub trait Event: Send + Sync + 'static {
    /// 이벤트 고유 ID (UUID v4)
    fn event_id(&self) -> &str;

    /// 이벤트 메타데이터
    fn metadata(&self) -> &EventMetadata;

    /// 이벤트 타입명 (로깅에 사용)
    fn event_type(&self) -> &str;
}

/// 전이 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    /// 컨테이너가 감시 네트워크에 합류
    Started,
    /// 컨테이너가 감시 네트워크를 떠남
    Stopped,
}

impl TransitionKind {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 컨테이너 상태 전이 이벤트
///
/// `Started`는 현재 시각, `Stopped`는 런타임 이벤트 시각을 `timestamp`로 가집니다.
/// `Stopped`의 컨테이너 스냅샷은 디렉토리에서 제거된 마지막 레코드입니다.
#[derive(Debug, Clone)]
pub struct NetworkTransition {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 전이 종류
    pub kind: TransitionKind,
    /// 컨테이너 스냅샷
    pub container: ContainerRecord,
    /// 전이 시각
    pub timestamp: SystemTime,
}

impl NetworkTransition {
    /// 현재 시각으로 `Started` 전이를 생성합니다.
    pub fn started(container: ContainerRecord) -> Self {
        Self::new(TransitionKind::Started, container, SystemTime::now())
    }

    /// 주어진 시각으로 `Stopped` 전이를 생성합니다.
    pub fn stopped(container: ContainerRecord, timestamp: SystemTime) -> Self {
        Self::new(TransitionKind::Stopped, container, timestamp)
    }

    fn new(kind: TransitionKind, container: ContainerRecord, timestamp: SystemTime) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::with_new_trace(MODULE_STATE_TRACKER),
            kind,
            container,
            timestamp,
        }
    }
}

impl Event for NetworkTransition {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_TRANSITION
    }
}

impl fmt::Display for NetworkTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetworkTransition[{}] {} {} at {}",
            &self.id[..8.min(self.id.len())],
            self.kind,
            self.container,
            unix_timestamp_str(self.timestamp),
        )
    }
}

fn unix_timestamp_str(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => format!("{}", duration.as_secs()),
        Err(_) => "unknown".to_owned(),
    }
}
