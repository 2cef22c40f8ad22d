//! 상태 추적기 -- 런타임 이벤트를 `Started`/`Stopped` 전이로 정규화
//!
//! [`StateTracker`]는 감시 네트워크에 있는 컨테이너 디렉토리를 소유합니다.
//!
//! # 흐름
//! ```text
//! list_containers ──> reconcile_startup ──┐
//!                                         ├──> Started/Stopped ──mpsc(200)──> PolicyReconciler
//! events() stream ──> classify ──> run ───┘
//!        ^                          │
//!        └──── backoff (2s) ────────┘  스트림 에러/종료 시 재구독
//! ```
//!
//! # 불변 조건
//! - 디렉토리 키는 유일합니다.
//! - 디렉토리에 항목이 있을 때만 "알려진" 컨테이너입니다.
//! - `Stopped`는 알려진 컨테이너에 대해서만 방출됩니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netwarden_core::event::{NetworkTransition, TransitionKind};
use netwarden_core::metrics as m;
use netwarden_core::types::{ContainerRecord, short_id};

use crate::config::NetworkGuardConfig;
use crate::directory::ContainerDirectory;
use crate::error::NetworkGuardError;
use crate::runtime::{ContainerFilters, EventFilters, RuntimeClient, RuntimeContainer, RuntimeEvent};

/// 추적기 카운터 (가드와 공유)
#[derive(Debug, Default)]
pub struct TrackerStats {
    transitions_emitted: AtomicU64,
    events_ignored: AtomicU64,
    stream_reconnects: AtomicU64,
}

impl TrackerStats {
    /// 방출된 전이 수
    pub fn transitions_emitted(&self) -> u64 {
        self.transitions_emitted.load(Ordering::Relaxed)
    }

    /// 무시된 이벤트 수
    pub fn events_ignored(&self) -> u64 {
        self.events_ignored.load(Ordering::Relaxed)
    }

    /// 이벤트 스트림 재연결 수
    pub fn stream_reconnects(&self) -> u64 {
        self.stream_reconnects.load(Ordering::Relaxed)
    }
}

/// 런타임 이벤트를 전이 종류로 분류합니다.
///
/// 컨테이너 이벤트가 아니거나 관심 없는 동작이면 `None`입니다.
pub fn classify(event: &RuntimeEvent) -> Option<TransitionKind> {
    if event.kind != "container" {
        return None;
    }
    let action = event.action_name();
    if action.starts_with("start") {
        Some(TransitionKind::Started)
    } else if ["stop", "die", "kill"]
        .iter()
        .any(|prefix| action.starts_with(prefix))
    {
        Some(TransitionKind::Stopped)
    } else {
        None
    }
}

/// 감시 대상 여부를 판단합니다.
///
/// 실행 중이고, 감시 네트워크에 연결되어 있으며, 활성화 레이블이 설정된 경우
/// 그 값이 대소문자 무관하게 `"true"`여야 합니다.
pub fn is_eligible(container: &RuntimeContainer, network: &str, enable_label: Option<&str>) -> bool {
    if !container.running || !container.networks.contains_key(network) {
        return false;
    }
    match enable_label {
        Some(label) => container
            .labels
            .get(label)
            .is_some_and(|value| value.eq_ignore_ascii_case("true")),
        None => true,
    }
}

/// 런타임 컨테이너에서 디렉토리 레코드를 생성합니다.
pub fn build_record(container: &RuntimeContainer, network: &str) -> ContainerRecord {
    ContainerRecord {
        id: container.id.clone(),
        name: container.display_name(),
        network: network.to_owned(),
        ip_address: container.ip_on(network),
        ports: container.ports.clone(),
        labels: container.labels.clone(),
    }
}

/// 상태 추적기
pub struct StateTracker<R: RuntimeClient> {
    runtime: Arc<R>,
    directory: ContainerDirectory,
    network: String,
    enable_label: Option<String>,
    reconnect_backoff: Duration,
    tx: mpsc::Sender<NetworkTransition>,
    cancel: CancellationToken,
    stats: Arc<TrackerStats>,
}

impl<R: RuntimeClient> StateTracker<R> {
    /// 새 추적기를 생성합니다.
    pub fn new(
        runtime: Arc<R>,
        config: &NetworkGuardConfig,
        directory: ContainerDirectory,
        tx: mpsc::Sender<NetworkTransition>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            directory,
            network: config.network.clone(),
            enable_label: config.enable_label().map(str::to_owned),
            reconnect_backoff: config.reconnect_backoff(),
            tx,
            cancel,
            stats: Arc::new(TrackerStats::default()),
        }
    }

    /// 외부에서 공유할 카운터를 지정합니다.
    pub fn with_stats(mut self, stats: Arc<TrackerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<TrackerStats> {
        Arc::clone(&self.stats)
    }

    pub fn directory(&self) -> &ContainerDirectory {
        &self.directory
    }

    /// 시작 시점의 실행 중 컨테이너를 디렉토리에 등록하고 `Started`를 방출합니다.
    ///
    /// 라이브 이벤트 구독 전에 호출해야 합니다.
    ///
    /// # Errors
    ///
    /// 컨테이너 목록 조회 실패는 치명적이며 그대로 반환됩니다.
    /// 방출 도중 취소되면 `NetworkGuardError::Channel`을 반환합니다.
    pub async fn reconcile_startup(&self) -> Result<usize, NetworkGuardError> {
        let filters = ContainerFilters {
            network: Some(self.network.clone()),
            label: self.enable_label.clone(),
            id: None,
        };
        let containers = self.runtime.list_containers(&filters).await?;
        debug!(listed = containers.len(), "startup discovery");

        let mut started = 0;
        for container in &containers {
            if !is_eligible(container, &self.network, self.enable_label.as_deref()) {
                debug!(
                    container_id = short_id(&container.id),
                    "container does not match watch criteria"
                );
                continue;
            }
            let record = build_record(container, &self.network);
            info!(
                container = %record.name,
                container_id = record.short_id(),
                "discovered container"
            );
            self.directory.insert(record.clone()).await;
            self.update_known_gauge().await;
            if !self.emit(NetworkTransition::started(record)).await {
                return Err(NetworkGuardError::Channel(
                    "transition queue closed during startup".to_owned(),
                ));
            }
            started += 1;
        }

        info!(containers = started, network = %self.network, "startup reconciliation complete");
        Ok(started)
    }

    /// 이벤트 구독 루프를 실행합니다. 취소될 때까지 반환하지 않습니다.
    ///
    /// 스트림 에러나 종료 시 backoff 후 재구독하며 재시도 횟수 제한은 없습니다.
    pub async fn run(self) {
        let filters = EventFilters {
            label: self.enable_label.clone(),
        };

        info!(network = %self.network, "watching container events");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut stream = self.runtime.events(&filters);
            loop {
                let item = tokio::select! {
                    () = self.cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(NetworkGuardError::EventDecode(e))) => {
                        warn!(error = %e, "skipping undecodable event");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream failed");
                        break;
                    }
                    None => {
                        warn!("event stream ended");
                        break;
                    }
                }
            }

            self.stats.stream_reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::TRACKER_STREAM_RECONNECTS_TOTAL).increment(1);
            info!(
                backoff_secs = self.reconnect_backoff.as_secs(),
                "reconnecting to event stream"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_backoff) => {}
            }
        }
        debug!("event subscription loop stopped");
    }

    async fn handle_event(&self, event: RuntimeEvent) {
        match classify(&event) {
            Some(TransitionKind::Started) => self.handle_started(&event.actor_id).await,
            Some(TransitionKind::Stopped) => {
                let at = event.time.unwrap_or_else(SystemTime::now);
                self.handle_stopped(&event.actor_id, at).await;
            }
            None => {
                self.ignore();
                debug!(
                    kind = %event.kind,
                    action = event.action_name(),
                    "ignoring event"
                );
            }
        }
    }

    async fn handle_started(&self, id: &str) {
        let container = match self.runtime.inspect_container(id).await {
            Ok(container) => container,
            Err(NetworkGuardError::ContainerNotFound(_)) => {
                info!(container_id = short_id(id), "started container disappeared before inspect");
                self.ignore();
                return;
            }
            Err(e) => {
                warn!(container_id = short_id(id), error = %e, "failed to inspect started container");
                self.ignore();
                return;
            }
        };

        if !is_eligible(&container, &self.network, self.enable_label.as_deref()) {
            debug!(container_id = short_id(id), "started container is not watched");
            self.ignore();
            return;
        }

        let record = build_record(&container, &self.network);
        info!(
            container = %record.name,
            container_id = record.short_id(),
            "container started"
        );
        self.directory.insert(record.clone()).await;
        self.update_known_gauge().await;
        self.emit(NetworkTransition::started(record)).await;
    }

    async fn handle_stopped(&self, id: &str, at: SystemTime) {
        let Some(record) = self.directory.remove(id).await else {
            debug!(container_id = short_id(id), "stop for unknown container");
            self.ignore();
            return;
        };

        info!(
            container = %record.name,
            container_id = record.short_id(),
            "container stopped"
        );
        self.update_known_gauge().await;
        self.emit(NetworkTransition::stopped(record, at)).await;
    }

    /// 전이를 큐에 넣습니다. 큐가 가득 차면 취소와 경합하며 대기합니다.
    async fn emit(&self, transition: NetworkTransition) -> bool {
        let kind = transition.kind;
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            result = self.tx.send(transition) => result.is_ok(),
        };

        if sent {
            self.stats.transitions_emitted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::TRACKER_TRANSITIONS_TOTAL, m::LABEL_KIND => kind.as_str())
                .increment(1);
        } else {
            debug!(kind = %kind, "transition dropped, queue closed or cancelled");
        }
        sent
    }

    fn ignore(&self) {
        self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TRACKER_EVENTS_IGNORED_TOTAL).increment(1);
    }

    async fn update_known_gauge(&self) {
        metrics::gauge!(m::TRACKER_KNOWN_CONTAINERS).set(self.directory.len().await as f64);
    }
}
