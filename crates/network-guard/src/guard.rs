//! 네트워크 가드 오케스트레이터 -- 상태 추적기와 정책 조정기의 생명주기 관리
//!
//! [`NetworkGuard`]는 core의 [`Pipeline`] trait을 구현하여
//! `netwarden-daemon`에서 start/stop/health_check 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! RuntimeClient ──> StateTracker ──mpsc──> PolicyReconciler ──> RuleExecutor
//!                        |                        |
//!                 ContainerDirectory        TaskTracker (전이별 태스크)
//!
//!            CancellationToken ──> 구독 루프, 디스패치 루프, 큐 대기, 워밍업
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use netwarden_core::error::{NetwardenError, PipelineError};
use netwarden_core::pipeline::{HealthStatus, Pipeline};
use netwarden_core::types::ContainerRecord;

use crate::config::NetworkGuardConfig;
use crate::directory::ContainerDirectory;
use crate::error::NetworkGuardError;
use crate::reconciler::{PolicyReconciler, ReconcilerStats};
use crate::rules::RuleExecutor;
use crate::runtime::RuntimeClient;
use crate::tracker::{StateTracker, TrackerStats};
use crate::warmup::Prober;

/// 가드 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 네트워크 가드 -- 컨테이너 상태 추적과 방화벽 정책 조정의 전체 흐름을 관리합니다.
///
/// 정지된 가드는 다시 시작할 수 없습니다. 재시작하려면 빌더로 새 인스턴스를 생성하세요.
///
/// # 사용 예시
/// ```ignore
/// use netwarden_network_guard::{NetworkGuardBuilder, BollardRuntimeClient, IptablesExecutor, NetProber};
///
/// let mut guard = NetworkGuardBuilder::new()
///     .config(config)
///     .runtime(Arc::new(BollardRuntimeClient::connect("")?))
///     .executor(Arc::new(IptablesExecutor::new("iptables", timeout)))
///     .prober(Arc::new(NetProber::new(timeout)))
///     .build()?;
///
/// guard.start().await?;
/// ```
pub struct NetworkGuard<R: RuntimeClient, E: RuleExecutor, P: Prober> {
    config: NetworkGuardConfig,
    state: GuardState,
    runtime: Arc<R>,
    executor: Arc<E>,
    prober: Arc<P>,
    directory: ContainerDirectory,
    cancel: CancellationToken,
    /// 구독 루프와 디스패치 루프
    tasks: Vec<tokio::task::JoinHandle<()>>,
    /// 전이별 처리 태스크
    handlers: TaskTracker,
    tracker_stats: Arc<TrackerStats>,
    reconciler_stats: Arc<ReconcilerStats>,
}

impl<R: RuntimeClient, E: RuleExecutor, P: Prober> NetworkGuard<R, E, P> {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            GuardState::Initialized => "initialized",
            GuardState::Running => "running",
            GuardState::Stopped => "stopped",
        }
    }

    /// 가드 설정
    pub fn config(&self) -> &NetworkGuardConfig {
        &self.config
    }

    /// 가드 전체가 공유하는 취소 토큰
    ///
    /// 데몬은 정지 신호를 받으면 이 토큰을 먼저 취소해 진행 중인 대기를 끊을 수 있습니다.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 알려진 컨테이너의 스냅샷을 반환합니다.
    pub async fn known_containers(&self) -> Vec<ContainerRecord> {
        self.directory.snapshot().await
    }

    /// 알려진 컨테이너 수를 반환합니다.
    pub async fn container_count(&self) -> usize {
        self.directory.len().await
    }

    /// 방출된 전이 수
    pub fn transitions_emitted(&self) -> u64 {
        self.tracker_stats.transitions_emitted()
    }

    /// 처리 태스크로 넘겨진 전이 수
    pub fn transitions_dispatched(&self) -> u64 {
        self.reconciler_stats.transitions_handled()
    }

    /// 성공한 규칙 실행 수
    pub fn rules_applied(&self) -> u64 {
        self.reconciler_stats.rules_applied()
    }

    /// 실패한 규칙 실행 수
    pub fn rule_failures(&self) -> u64 {
        self.reconciler_stats.rule_failures()
    }

    /// 워밍업 실패 수
    pub fn warmup_failures(&self) -> u64 {
        self.reconciler_stats.warmup_failures()
    }

    /// 이벤트 스트림 재연결 수
    pub fn stream_reconnects(&self) -> u64 {
        self.tracker_stats.stream_reconnects()
    }
}

impl<R: RuntimeClient, E: RuleExecutor, P: Prober> Pipeline for NetworkGuard<R, E, P> {
    async fn start(&mut self) -> Result<(), NetwardenError> {
        match self.state {
            GuardState::Running => return Err(PipelineError::AlreadyRunning.into()),
            GuardState::Stopped => {
                return Err(PipelineError::InitFailed(
                    "network guard was stopped; rebuild the guard to restart".to_owned(),
                )
                .into());
            }
            GuardState::Initialized => {}
        }

        info!(network = %self.config.network, "starting network guard");

        // 1. 런타임 연결 확인 (실패 시 치명적)
        self.runtime.ping().await?;

        // 2. 전이 큐 생성
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        // 3. 디스패치 루프 스폰
        let reconciler = Arc::new(
            PolicyReconciler::new(
                Arc::clone(&self.executor),
                Arc::clone(&self.prober),
                &self.config,
                self.cancel.clone(),
            )
            .with_stats(Arc::clone(&self.reconciler_stats)),
        );
        let dispatch = tokio::spawn(reconciler.run(rx, self.handlers.clone()));

        // 4. 시작 시점 조정 (실패 시 디스패치 루프 취소)
        let tracker = StateTracker::new(
            Arc::clone(&self.runtime),
            &self.config,
            self.directory.clone(),
            tx,
            self.cancel.clone(),
        )
        .with_stats(Arc::clone(&self.tracker_stats));

        match tracker.reconcile_startup().await {
            Ok(count) => info!(containers = count, "initial container inventory loaded"),
            Err(e) => {
                self.cancel.cancel();
                let _ = dispatch.await;
                return Err(e.into());
            }
        }

        // 5. 구독 루프 스폰
        let subscription = tokio::spawn(tracker.run());

        self.tasks.push(dispatch);
        self.tasks.push(subscription);
        self.state = GuardState::Running;
        info!("network guard started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NetwardenError> {
        if self.state != GuardState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping network guard");
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.handlers.close();
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.handlers.wait()).await.is_err() {
            warn!(
                in_flight = self.handlers.len(),
                grace_secs = grace.as_secs(),
                "in-flight handlers did not finish within grace period"
            );
        }

        self.state = GuardState::Stopped;
        info!(
            transitions = self.tracker_stats.transitions_emitted(),
            rules_applied = self.reconciler_stats.rules_applied(),
            rule_failures = self.reconciler_stats.rule_failures(),
            "network guard stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            GuardState::Running => {
                if self.runtime.ping().await.is_ok() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded("container runtime not reachable".to_owned())
                }
            }
            GuardState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            GuardState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 네트워크 가드 빌더
///
/// 런타임 클라이언트, 규칙 실행기, 프로버는 모두 필수입니다.
pub struct NetworkGuardBuilder<R: RuntimeClient, E: RuleExecutor, P: Prober> {
    config: NetworkGuardConfig,
    runtime: Option<Arc<R>>,
    executor: Option<Arc<E>>,
    prober: Option<Arc<P>>,
    cancel: Option<CancellationToken>,
}

impl<R: RuntimeClient, E: RuleExecutor, P: Prober> NetworkGuardBuilder<R, E, P> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: NetworkGuardConfig::default(),
            runtime: None,
            executor: None,
            prober: None,
            cancel: None,
        }
    }

    /// 가드 설정을 지정합니다.
    pub fn config(mut self, config: NetworkGuardConfig) -> Self {
        self.config = config;
        self
    }

    /// 런타임 클라이언트를 설정합니다.
    pub fn runtime(mut self, runtime: Arc<R>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// 규칙 실행기를 설정합니다.
    pub fn executor(mut self, executor: Arc<E>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 워밍업 프로버를 설정합니다.
    pub fn prober(mut self, prober: Arc<P>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// 외부 취소 토큰을 사용합니다. 지정하지 않으면 새 토큰을 생성합니다.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 가드를 빌드합니다.
    ///
    /// # Errors
    ///
    /// 설정 검증 실패나 필수 구성요소 누락 시 `NetworkGuardError::Config`를 반환합니다.
    pub fn build(self) -> Result<NetworkGuard<R, E, P>, NetworkGuardError> {
        self.config.validate()?;

        let runtime = self.runtime.ok_or_else(|| missing("runtime"))?;
        let executor = self.executor.ok_or_else(|| missing("executor"))?;
        let prober = self.prober.ok_or_else(|| missing("prober"))?;

        Ok(NetworkGuard {
            config: self.config,
            state: GuardState::Initialized,
            runtime,
            executor,
            prober,
            directory: ContainerDirectory::new(),
            cancel: self.cancel.unwrap_or_default(),
            tasks: Vec::new(),
            handlers: TaskTracker::new(),
            tracker_stats: Arc::new(TrackerStats::default()),
            reconciler_stats: Arc::new(ReconcilerStats::default()),
        })
    }
}

impl<R: RuntimeClient, E: RuleExecutor, P: Prober> Default for NetworkGuardBuilder<R, E, P> {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(component: &str) -> NetworkGuardError {
    NetworkGuardError::Config {
        field: component.to_owned(),
        reason: format!("{component} must be provided"),
    }
}
