//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `netwarden_`
//! - 모듈명: `tracker_`, `reconciler_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use netwarden_core::metrics as m;
//!
//! metrics::counter!(m::TRACKER_TRANSITIONS_TOTAL, m::LABEL_KIND => "started").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 전이 종류 레이블 키 (started, stopped)
pub const LABEL_KIND: &str = "kind";

/// 규칙 종류 레이블 키 (mark, dnat, forward)
pub const LABEL_RULE: &str = "rule";

/// 규칙 액션 레이블 키 (install, retract)
pub const LABEL_ACTION: &str = "action";

/// 결과 레이블 키 (success, failure)
pub const LABEL_RESULT: &str = "result";

// ─── State Tracker 메트릭 ──────────────────────────────────────────

/// Tracker: 디렉토리에 등록된 컨테이너 수 (gauge)
pub const TRACKER_KNOWN_CONTAINERS: &str = "netwarden_tracker_known_containers";

/// Tracker: 방출된 전이 수 (counter, label: kind)
pub const TRACKER_TRANSITIONS_TOTAL: &str = "netwarden_tracker_transitions_total";

/// Tracker: 무시된 런타임 이벤트 수 (counter)
pub const TRACKER_EVENTS_IGNORED_TOTAL: &str = "netwarden_tracker_events_ignored_total";

/// Tracker: 이벤트 스트림 재연결 수 (counter)
pub const TRACKER_STREAM_RECONNECTS_TOTAL: &str = "netwarden_tracker_stream_reconnects_total";

// ─── Policy Reconciler 메트릭 ──────────────────────────────────────

/// Reconciler: 처리한 전이 수 (counter, label: kind)
pub const RECONCILER_TRANSITIONS_HANDLED_TOTAL: &str =
    "netwarden_reconciler_transitions_handled_total";

/// Reconciler: 적용된 규칙 수 (counter, labels: rule, action)
pub const RECONCILER_RULES_APPLIED_TOTAL: &str = "netwarden_reconciler_rules_applied_total";

/// Reconciler: 실패한 규칙 수 (counter, labels: rule, action)
pub const RECONCILER_RULE_FAILURES_TOTAL: &str = "netwarden_reconciler_rule_failures_total";

/// Reconciler: 워밍업 실패 수 (counter)
pub const RECONCILER_WARMUP_FAILURES_TOTAL: &str = "netwarden_reconciler_warmup_failures_total";

/// Reconciler: 워밍업 소요 시간 (histogram, 초, label: result)
pub const RECONCILER_WARMUP_DURATION_SECONDS: &str =
    "netwarden_reconciler_warmup_duration_seconds";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "netwarden_daemon_uptime_seconds";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "netwarden_daemon_build_info";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 워밍업 소요 시간 히스토그램 버킷 (초)
///
/// 기본 정책(1초 간격 60회)의 전 범위를 덮습니다.
pub const WARMUP_DURATION_BUCKETS: [f64; 9] = [0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0, 120.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // State Tracker
    describe_gauge!(
        TRACKER_KNOWN_CONTAINERS,
        "Containers currently known on the watched network"
    );
    describe_counter!(
        TRACKER_TRANSITIONS_TOTAL,
        "Started/Stopped transitions emitted by the state tracker"
    );
    describe_counter!(
        TRACKER_EVENTS_IGNORED_TOTAL,
        "Runtime events discarded by the state tracker"
    );
    describe_counter!(
        TRACKER_STREAM_RECONNECTS_TOTAL,
        "Runtime event stream resubscriptions"
    );

    // Policy Reconciler
    describe_counter!(
        RECONCILER_TRANSITIONS_HANDLED_TOTAL,
        "Transitions processed by the policy reconciler"
    );
    describe_counter!(
        RECONCILER_RULES_APPLIED_TOTAL,
        "Firewall rule invocations that succeeded"
    );
    describe_counter!(
        RECONCILER_RULE_FAILURES_TOTAL,
        "Firewall rule invocations that failed"
    );
    describe_counter!(
        RECONCILER_WARMUP_FAILURES_TOTAL,
        "Warm-up probes that exhausted every attempt"
    );
    describe_histogram!(
        RECONCILER_WARMUP_DURATION_SECONDS,
        "Time spent warming up a container in seconds"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Netwarden daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        TRACKER_KNOWN_CONTAINERS,
        TRACKER_TRANSITIONS_TOTAL,
        TRACKER_EVENTS_IGNORED_TOTAL,
        TRACKER_STREAM_RECONNECTS_TOTAL,
        RECONCILER_TRANSITIONS_HANDLED_TOTAL,
        RECONCILER_RULES_APPLIED_TOTAL,
        RECONCILER_RULE_FAILURES_TOTAL,
        RECONCILER_WARMUP_FAILURES_TOTAL,
        RECONCILER_WARMUP_DURATION_SECONDS,
        DAEMON_UPTIME_SECONDS,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_netwarden_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("netwarden_"),
                "Metric '{}' does not start with 'netwarden_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_end_with_total() {
        let counters = [
            TRACKER_TRANSITIONS_TOTAL,
            TRACKER_EVENTS_IGNORED_TOTAL,
            TRACKER_STREAM_RECONNECTS_TOTAL,
            RECONCILER_TRANSITIONS_HANDLED_TOTAL,
            RECONCILER_RULES_APPLIED_TOTAL,
            RECONCILER_RULE_FAILURES_TOTAL,
            RECONCILER_WARMUP_FAILURES_TOTAL,
        ];
        for name in counters {
            assert!(name.ends_with("_total"), "{name} should end with _total");
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        // 레코더가 설치되지 않은 상태에서도 패닉하지 않아야 함
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_KIND, LABEL_RULE, LABEL_ACTION, LABEL_RESULT] {
            assert_eq!(label.to_lowercase(), label);
        }
    }

    #[test]
    fn warmup_buckets_are_sorted() {
        let buckets = WARMUP_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(
                buckets[i] > buckets[i - 1],
                "Bucket values must be in ascending order"
            );
        }
    }
}
