//! 정책 조정기 -- 전이를 방화벽 규칙 변경으로 변환
//!
//! [`PolicyReconciler`]는 큐에서 전이를 꺼내 전이마다 별도 태스크로 처리합니다.
//!
//! # Started
//! 1. 워밍업: 첫 게시 포트로 전송 프로브, 실패 시 ICMP (실패해도 계속 진행)
//! 2. DNAT: DNAT 레이블이 설정되어 있고 컨테이너에 레이블이 있으면
//!    의도마다 nat PREROUTING DNAT + FORWARD ACCEPT 설치
//! 3. 마킹: 마크 값이 설정되어 있으면 DNAT 의도에 없는 게시 포트마다 mangle MARK 설치
//!
//! # Stopped
//! 마지막으로 알려진 스냅샷을 기준으로 같은 규칙을 같은 순서로 철회합니다. 워밍업은 없습니다.
//!
//! # 동시성
//! 서로 다른 컨테이너의 처리 순서는 보장되지 않습니다.
//! 같은 컨테이너라도 큐까지만 FIFO이며, 처리 태스크끼리는 경합할 수 있습니다.
//! 같은 컨테이너의 Started가 Stopped 없이 반복되면 규칙이 중복 설치됩니다.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use netwarden_core::event::{NetworkTransition, TransitionKind};
use netwarden_core::metrics as m;
use netwarden_core::types::ContainerRecord;

use crate::config::NetworkGuardConfig;
use crate::ports::{PortIntent, mark_intents, parse_ports};
use crate::rules::{FirewallRule, RuleAction, RuleExecutor};
use crate::warmup::{Prober, WarmupOutcome, WarmupPolicy, warm_up};

/// 조정기 카운터 (가드와 공유)
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    transitions_handled: AtomicU64,
    rules_applied: AtomicU64,
    rule_failures: AtomicU64,
    warmup_failures: AtomicU64,
}

impl ReconcilerStats {
    /// 처리 태스크로 넘겨진 전이 수
    pub fn transitions_handled(&self) -> u64 {
        self.transitions_handled.load(Ordering::Relaxed)
    }

    /// 성공한 규칙 실행 수 (설치 + 철회)
    pub fn rules_applied(&self) -> u64 {
        self.rules_applied.load(Ordering::Relaxed)
    }

    /// 실패한 규칙 실행 수
    pub fn rule_failures(&self) -> u64 {
        self.rule_failures.load(Ordering::Relaxed)
    }

    /// 워밍업 실패 수
    pub fn warmup_failures(&self) -> u64 {
        self.warmup_failures.load(Ordering::Relaxed)
    }
}

/// 정책 조정기
pub struct PolicyReconciler<E: RuleExecutor, P: Prober> {
    executor: Arc<E>,
    prober: Arc<P>,
    warmup: WarmupPolicy,
    mark: Option<String>,
    dnat_label: Option<String>,
    cancel: CancellationToken,
    stats: Arc<ReconcilerStats>,
}

impl<E: RuleExecutor, P: Prober> PolicyReconciler<E, P> {
    /// 새 조정기를 생성합니다.
    pub fn new(
        executor: Arc<E>,
        prober: Arc<P>,
        config: &NetworkGuardConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            prober,
            warmup: config.warmup_policy(),
            mark: config.mark().map(str::to_owned),
            dnat_label: config.dnat_label().map(str::to_owned),
            cancel,
            stats: Arc::new(ReconcilerStats::default()),
        }
    }

    /// 외부에서 공유할 카운터를 지정합니다.
    pub fn with_stats(mut self, stats: Arc<ReconcilerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<ReconcilerStats> {
        Arc::clone(&self.stats)
    }

    /// 디스패치 루프를 실행합니다.
    ///
    /// 큐에서 꺼낸 전이마다 `tasks`에 처리 태스크를 생성합니다.
    /// 취소되거나 큐가 닫히면 반환하며, 진행 중인 태스크는 기다리지 않습니다.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<NetworkTransition>, tasks: TaskTracker) {
        info!("policy reconciler waiting for transitions");
        loop {
            let transition = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                transition = rx.recv() => transition,
            };
            let Some(transition) = transition else {
                info!("transition queue closed");
                break;
            };

            self.stats.transitions_handled.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                m::RECONCILER_TRANSITIONS_HANDLED_TOTAL,
                m::LABEL_KIND => transition.kind.as_str()
            )
            .increment(1);

            let this = Arc::clone(&self);
            tasks.spawn(async move { this.handle(transition).await });
        }
        debug!("policy reconciler dispatch loop stopped");
    }

    /// 전이 하나를 처리합니다.
    pub async fn handle(&self, transition: NetworkTransition) {
        debug!(
            event_id = %transition.id,
            trace_id = %transition.metadata.trace_id,
            kind = %transition.kind,
            "handling transition"
        );
        match transition.kind {
            TransitionKind::Started => self.handle_started(&transition.container).await,
            TransitionKind::Stopped => self.handle_stopped(&transition.container).await,
        }
    }

    async fn handle_started(&self, container: &ContainerRecord) {
        info!(
            container = %container.name,
            container_id = container.short_id(),
            "handling container started"
        );
        let Some(ip) = container.ip_address else {
            warn!(
                container = %container.name,
                container_id = container.short_id(),
                "container has no address on watched network, skipping"
            );
            return;
        };

        let started_at = Instant::now();
        let outcome = warm_up(
            self.prober.as_ref(),
            &self.warmup,
            ip,
            container.ports.first(),
            &self.cancel,
        )
        .await;
        metrics::histogram!(m::RECONCILER_WARMUP_DURATION_SECONDS)
            .record(started_at.elapsed().as_secs_f64());

        match outcome {
            WarmupOutcome::Failed => {
                self.stats.warmup_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::RECONCILER_WARMUP_FAILURES_TOTAL).increment(1);
            }
            WarmupOutcome::Cancelled => {
                info!(
                    container = %container.name,
                    "warm-up cancelled by shutdown, rules not installed"
                );
                return;
            }
            WarmupOutcome::Transport { .. } | WarmupOutcome::Icmp { .. } => {}
        }

        self.apply_all(RuleAction::Install, container, ip).await;
    }

    async fn handle_stopped(&self, container: &ContainerRecord) {
        info!(
            container = %container.name,
            container_id = container.short_id(),
            "handling container stopped"
        );
        let Some(ip) = container.ip_address else {
            debug!(container = %container.name, "no address recorded, nothing to retract");
            return;
        };
        self.apply_all(RuleAction::Retract, container, ip).await;
    }

    /// 컨테이너에 해당하는 모든 규칙을 순서대로 실행합니다.
    async fn apply_all(&self, action: RuleAction, container: &ContainerRecord, ip: IpAddr) {
        let dnat = self.dnat_intents(container);
        for intent in &dnat {
            let dnat_rule = FirewallRule::Dnat {
                protocol: intent.protocol.clone(),
                port: intent.port,
                destination: ip,
            };
            self.apply(action, &dnat_rule, container).await;

            let forward_rule = FirewallRule::ForwardAccept {
                protocol: intent.protocol.clone(),
                port: intent.port,
                destination: ip,
            };
            self.apply(action, &forward_rule, container).await;
        }

        if let Some(mark) = &self.mark {
            for intent in mark_intents(&container.ports, &dnat) {
                let rule = FirewallRule::Mark {
                    protocol: intent.protocol,
                    port: intent.port,
                    mark: mark.clone(),
                };
                self.apply(action, &rule, container).await;
            }
        }
    }

    fn dnat_intents(&self, container: &ContainerRecord) -> Vec<PortIntent> {
        let Some(value) = self
            .dnat_label
            .as_deref()
            .and_then(|label| container.label(label))
        else {
            return Vec::new();
        };

        let parsed = parse_ports(value);
        for err in &parsed.malformed {
            warn!(
                container = %container.name,
                error = %err,
                "skipping malformed dnat port"
            );
        }
        parsed.intents
    }

    async fn apply(&self, action: RuleAction, rule: &FirewallRule, container: &ContainerRecord) {
        match self.executor.apply(action, rule).await {
            Ok(()) => {
                self.stats.rules_applied.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    m::RECONCILER_RULES_APPLIED_TOTAL,
                    m::LABEL_RULE => rule.kind_name(),
                    m::LABEL_ACTION => action.as_str()
                )
                .increment(1);
                info!(
                    container = %container.name,
                    rule = rule.kind_name(),
                    action = %action,
                    port = rule.port(),
                    protocol = %rule.protocol(),
                    "firewall rule applied"
                );
            }
            Err(e) => {
                self.stats.rule_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    m::RECONCILER_RULE_FAILURES_TOTAL,
                    m::LABEL_RULE => rule.kind_name(),
                    m::LABEL_ACTION => action.as_str()
                )
                .increment(1);
                error!(
                    container = %container.name,
                    rule = rule.kind_name(),
                    action = %action,
                    port = rule.port(),
                    protocol = %rule.protocol(),
                    error = %e,
                    "firewall rule failed"
                );
            }
        }
    }
}
