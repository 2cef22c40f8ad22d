//! Container runtime API abstraction for testability.
//!
//! The [`RuntimeClient`] trait abstracts the Docker/Podman API, allowing
//! production code to use [`BollardRuntimeClient`] while tests use `MockRuntimeClient`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ StateTracker │
//! └──────┬───────┘
//!        │
//!        ▼
//!  ┌─────────────┐
//!  │RuntimeClient│ (trait)
//!  └─────────────┘
//!       │     │
//!       ▼     ▼
//!  ┌───────┐ ┌────┐
//!  │Bollard│ │Mock│
//!  └───┬───┘ └────┘
//!      │
//!      ▼
//!  Docker / Podman socket
//! ```
//!
//! # Endpoint resolution
//!
//! An empty API address triggers socket auto-detection (see [`socket_candidates`]).
//! Plain paths and `unix://` addresses connect over a Unix socket;
//! `http://` and `tcp://` addresses connect over TCP.
//!
//! # Podman compatibility
//!
//! Podman reports the lifecycle verb in `status` where Docker uses `action`.
//! [`RuntimeEvent::action_name`] prefers `action` and falls back to `status`.
//! The bollard event model only carries `action`, so events decoded by
//! [`BollardRuntimeClient`] always have `status == None`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::debug;

use netwarden_core::types::{PortMapping, Protocol};

use crate::error::NetworkGuardError;

/// Connection timeout passed to bollard (seconds).
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Socket used when nothing else is found.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Rootful Podman socket.
pub const DEFAULT_PODMAN_SOCKET: &str = "/run/podman/podman.sock";

/// Lifecycle verbs the event subscription asks the runtime for.
pub const WATCHED_ACTIONS: [&str; 4] = ["start", "stop", "die", "kill"];

/// Filters for [`RuntimeClient::list_containers`].
///
/// `None` fields are not sent to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilters {
    /// Only containers attached to this network.
    pub network: Option<String>,
    /// Only containers carrying this label key.
    pub label: Option<String>,
    /// Only the container with this ID.
    pub id: Option<String>,
}

impl ContainerFilters {
    /// Converts the filters to the runtime's `filters` query map.
    pub fn to_query(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if let Some(network) = &self.network {
            filters.insert("network".to_owned(), vec![network.clone()]);
        }
        if let Some(label) = &self.label {
            filters.insert("label".to_owned(), vec![label.clone()]);
        }
        if let Some(id) = &self.id {
            filters.insert("id".to_owned(), vec![id.clone()]);
        }
        filters
    }
}

/// Filters for [`RuntimeClient::events`].
///
/// The subscription is always restricted to `type=container` and
/// the [`WATCHED_ACTIONS`] verbs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilters {
    /// Only events from containers carrying this label key.
    pub label: Option<String>,
}

impl EventFilters {
    /// Converts the filters to the runtime's `filters` query map.
    pub fn to_query(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_owned(), vec!["container".to_owned()]);
        filters.insert(
            "event".to_owned(),
            WATCHED_ACTIONS.iter().map(|a| (*a).to_owned()).collect(),
        );
        if let Some(label) = &self.label {
            filters.insert("label".to_owned(), vec![label.clone()]);
        }
        filters
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContainer {
    /// Full container ID.
    pub id: String,
    /// Runtime names (Docker prefixes them with `/`).
    pub names: Vec<String>,
    /// Whether the container is running.
    pub running: bool,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Attached networks mapped to the IP address on each (may be empty).
    pub networks: HashMap<String, String>,
    /// Published ports (public port > 0 only).
    pub ports: Vec<PortMapping>,
}

impl RuntimeContainer {
    /// First name with the leading `/` stripped.
    pub fn display_name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_owned())
            .unwrap_or_default()
    }

    /// IP address on `network`, if attached and assigned.
    pub fn ip_on(&self, network: &str) -> Option<IpAddr> {
        self.networks
            .get(network)
            .and_then(|ip| ip.parse::<IpAddr>().ok())
    }
}

/// A raw lifecycle event from the runtime's event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Event type (`container`, `network`, `image`, ...).
    pub kind: String,
    /// ID of the object the event is about.
    pub actor_id: String,
    /// Docker-style verb.
    pub action: Option<String>,
    /// Podman-style verb.
    pub status: Option<String>,
    /// Event time reported by the runtime.
    pub time: Option<SystemTime>,
}

impl RuntimeEvent {
    /// Lifecycle verb: `action` when present and non-empty, otherwise `status`.
    pub fn action_name(&self) -> &str {
        match self.action.as_deref() {
            Some(action) if !action.is_empty() => action,
            _ => self.status.as_deref().unwrap_or(""),
        }
    }
}

/// Trait abstracting container runtime API operations.
///
/// The trait is `Send + Sync + 'static`, allowing safe sharing across async contexts.
///
/// # Error Handling
///
/// - **404 errors**: Converted to `NetworkGuardError::ContainerNotFound`
/// - **Connection errors**: Wrapped as `NetworkGuardError::RuntimeConnection`
/// - **Stream I/O errors**: Yielded as `NetworkGuardError::EventStream`
/// - **Undecodable events**: Yielded as `NetworkGuardError::EventDecode`
pub trait RuntimeClient: Send + Sync + 'static {
    /// Lists running containers matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns `NetworkGuardError::RuntimeApi` if the API call fails.
    fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> impl Future<Output = Result<Vec<RuntimeContainer>, NetworkGuardError>> + Send;

    /// Inspects a single container by ID.
    ///
    /// # Errors
    ///
    /// - `NetworkGuardError::ContainerNotFound`: Container does not exist (404)
    /// - `NetworkGuardError::RuntimeApi`: Other API errors
    fn inspect_container(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<RuntimeContainer, NetworkGuardError>> + Send;

    /// Subscribes to container lifecycle events.
    ///
    /// The stream ends or yields `EventStream` when the connection drops;
    /// the caller is responsible for resubscribing.
    fn events(
        &self,
        filters: &EventFilters,
    ) -> BoxStream<'static, Result<RuntimeEvent, NetworkGuardError>>;

    /// Checks runtime connectivity.
    ///
    /// # Errors
    ///
    /// Returns `NetworkGuardError::RuntimeConnection` if the runtime is unreachable.
    fn ping(&self) -> impl Future<Output = Result<(), NetworkGuardError>> + Send;
}

/// Where to reach the runtime API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// HTTP address (`http://` or `tcp://`).
    Http(String),
}

impl RuntimeEndpoint {
    /// Parses a configured API address. An empty address auto-detects a socket.
    pub fn resolve(api: &str) -> Self {
        let api = api.trim();
        if api.is_empty() {
            return Self::Unix(detect_socket());
        }
        if let Some(path) = api.strip_prefix("unix://") {
            return Self::Unix(PathBuf::from(path));
        }
        if api.starts_with("http://") || api.starts_with("tcp://") {
            return Self::Http(api.to_owned());
        }
        Self::Unix(PathBuf::from(api))
    }
}

impl std::fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Http(addr) => f.write_str(addr),
        }
    }
}

/// Socket paths probed during auto-detection, in priority order.
///
/// 1. rootful Docker
/// 2. rootful Podman
/// 3. rootless Podman under the user's runtime dir
/// 4. Docker Desktop under the home directory
pub fn socket_candidates(runtime_dir: Option<&Path>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(DEFAULT_DOCKER_SOCKET),
        PathBuf::from(DEFAULT_PODMAN_SOCKET),
    ];
    if let Some(dir) = runtime_dir {
        candidates.push(dir.join("podman").join("podman.sock"));
    }
    if let Some(home) = home {
        candidates.push(home.join(".docker").join("run").join("docker.sock"));
    }
    candidates
}

/// Returns the first existing candidate socket, or the Docker default.
pub fn detect_socket() -> PathBuf {
    let runtime_dir = user_runtime_dir();
    let home = dirs::home_dir();
    let found = socket_candidates(runtime_dir.as_deref(), home.as_deref())
        .into_iter()
        .find(|candidate| candidate.exists());
    match found {
        Some(path) => {
            debug!(socket = %path.display(), "runtime socket detected");
            path
        }
        None => PathBuf::from(DEFAULT_DOCKER_SOCKET),
    }
}

/// `$XDG_RUNTIME_DIR`, or `/run/user/<uid>` when it is unset.
fn user_runtime_dir() -> Option<PathBuf> {
    dirs::runtime_dir().or_else(fallback_runtime_dir)
}

#[cfg(unix)]
fn fallback_runtime_dir() -> Option<PathBuf> {
    let uid = rustix::process::getuid().as_raw();
    Some(PathBuf::from(format!("/run/user/{uid}")))
}

#[cfg(not(unix))]
fn fallback_runtime_dir() -> Option<PathBuf> {
    None
}

/// Production runtime client implementation using `bollard`.
///
/// Works against both Docker and Podman's Docker-compatible API.
/// Internally uses `Arc<bollard::Docker>` for safe sharing across async tasks.
pub struct BollardRuntimeClient {
    docker: Arc<bollard::Docker>,
    endpoint: RuntimeEndpoint,
}

impl BollardRuntimeClient {
    /// Connects to the runtime at `api` (see [`RuntimeEndpoint::resolve`]).
    ///
    /// # Errors
    ///
    /// Returns `NetworkGuardError::RuntimeConnection` if the client cannot be created.
    pub fn connect(api: &str) -> Result<Self, NetworkGuardError> {
        let endpoint = RuntimeEndpoint::resolve(api);
        let docker = match &endpoint {
            RuntimeEndpoint::Unix(path) => {
                let path = path.to_string_lossy();
                bollard::Docker::connect_with_socket(
                    &path,
                    CONNECT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )
            }
            RuntimeEndpoint::Http(addr) => bollard::Docker::connect_with_http(
                addr,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| {
            NetworkGuardError::RuntimeConnection(format!(
                "failed to connect to runtime at {endpoint}: {e}"
            ))
        })?;

        Ok(Self {
            docker: Arc::new(docker),
            endpoint,
        })
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }
}

impl RuntimeClient for BollardRuntimeClient {
    async fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> Result<Vec<RuntimeContainer>, NetworkGuardError> {
        use bollard::container::ListContainersOptions;

        let options = ListContainersOptions::<String> {
            all: false,
            filters: filters.to_query(),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| NetworkGuardError::RuntimeApi(format!("list containers failed: {e}")))?;

        Ok(containers.into_iter().map(container_from_summary).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, NetworkGuardError> {
        use bollard::container::InspectContainerOptions;

        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => NetworkGuardError::ContainerNotFound(id.to_owned()),
                other => NetworkGuardError::RuntimeApi(format!("inspect container failed: {other}")),
            })?;

        Ok(container_from_inspect(details))
    }

    fn events(
        &self,
        filters: &EventFilters,
    ) -> BoxStream<'static, Result<RuntimeEvent, NetworkGuardError>> {
        use bollard::system::EventsOptions;

        let options = EventsOptions::<String> {
            filters: filters.to_query(),
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .map(|item| item.map(event_from_message).map_err(map_stream_error))
            .boxed()
    }

    async fn ping(&self) -> Result<(), NetworkGuardError> {
        self.docker
            .ping()
            .await
            .map_err(|e| NetworkGuardError::RuntimeConnection(format!("ping failed: {e}")))?;
        Ok(())
    }
}

fn map_stream_error(err: bollard::errors::Error) -> NetworkGuardError {
    match err {
        bollard::errors::Error::JsonSerdeError { .. }
        | bollard::errors::Error::JsonDataError { .. } => {
            NetworkGuardError::EventDecode(err.to_string())
        }
        other => NetworkGuardError::EventStream(other.to_string()),
    }
}

fn protocol_from_port_type(typ: Option<String>) -> Protocol {
    match typ {
        Some(t) if !t.is_empty() => Protocol::from(t.as_str()),
        _ => Protocol::Tcp,
    }
}

fn endpoint_ips(
    networks: Option<HashMap<String, bollard::models::EndpointSettings>>,
) -> HashMap<String, String> {
    networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
        .collect()
}

/// 같은 (호스트 포트, 프로토콜)은 첫 항목만 남깁니다.
///
/// IPv4/IPv6 바인딩이 같은 포트를 각각 보고하므로 중복이 생깁니다.
fn dedup_published(ports: &mut Vec<PortMapping>) {
    let mut seen = HashSet::new();
    ports.retain(|p| seen.insert((p.host_port, p.protocol.clone())));
}

fn time_from_unix(secs: Option<i64>) -> Option<SystemTime> {
    secs.and_then(|s| u64::try_from(s).ok())
        .map(|s| SystemTime::UNIX_EPOCH + Duration::from_secs(s))
}

/// Converts a list entry. Only ports with a non-zero public port are kept.
pub(crate) fn container_from_summary(
    summary: bollard::models::ContainerSummary,
) -> RuntimeContainer {
    let mut ports: Vec<PortMapping> = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| {
            let public = port.public_port.filter(|p| *p > 0)?;
            Some(PortMapping {
                host_ip: port.ip.filter(|ip| !ip.is_empty()),
                host_port: public,
                container_port: port.private_port,
                protocol: protocol_from_port_type(port.typ.map(|t| t.to_string())),
            })
        })
        .collect();
    dedup_published(&mut ports);

    RuntimeContainer {
        id: summary.id.unwrap_or_default(),
        names: summary.names.unwrap_or_default(),
        running: summary.state.as_deref() == Some("running"),
        labels: summary.labels.unwrap_or_default(),
        networks: endpoint_ips(summary.network_settings.and_then(|n| n.networks)),
        ports,
    }
}

/// Converts an inspect response. Port keys look like `80/tcp`.
pub(crate) fn container_from_inspect(
    details: bollard::models::ContainerInspectResponse,
) -> RuntimeContainer {
    let (networks, port_map) = match details.network_settings {
        Some(settings) => (settings.networks, settings.ports),
        None => (None, None),
    };

    let mut ports = Vec::new();
    for (key, bindings) in port_map.unwrap_or_default() {
        let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        for binding in bindings.unwrap_or_default() {
            let host_port = binding
                .host_port
                .as_deref()
                .and_then(|p| p.parse::<u16>().ok())
                .filter(|p| *p > 0);
            if let Some(host_port) = host_port {
                ports.push(PortMapping {
                    host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                    host_port,
                    container_port,
                    protocol: protocol_from_port_type(Some(proto.to_owned())),
                });
            }
        }
    }
    // HashMap 순회 순서를 고정해 워밍업 대상 포트가 매번 같도록 함
    ports.sort_by_key(|p| (p.container_port, p.host_port));
    dedup_published(&mut ports);

    RuntimeContainer {
        id: details.id.unwrap_or_default(),
        names: details.name.into_iter().collect(),
        running: details.state.and_then(|s| s.running).unwrap_or(false),
        labels: details.config.and_then(|c| c.labels).unwrap_or_default(),
        networks: endpoint_ips(networks),
        ports,
    }
}

// bollard의 EventMessage에는 레거시 `status` 필드가 없으므로 항상 None.
// `status`는 action 없이 status만 보내는 구형 엔진 클라이언트용으로 남겨둠.
fn event_from_message(message: bollard::models::EventMessage) -> RuntimeEvent {
    RuntimeEvent {
        kind: message.typ.map(|t| t.to_string()).unwrap_or_default(),
        actor_id: message.actor.and_then(|a| a.id).unwrap_or_default(),
        action: message.action,
        status: None,
        time: time_from_unix(message.time),
    }
}

/// Scripted event stream item for `MockRuntimeClient`.
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// A decoded event.
    Event(RuntimeEvent),
    /// A single undecodable event; the stream continues.
    Decode(String),
    /// A connection failure; the stream ends after it.
    Disconnect(String),
}

/// 테스트용 Mock 런타임 클라이언트
///
/// `events()`를 호출할 때마다 준비된 배치를 하나씩 꺼내 스트림으로 돌려줍니다.
/// 배치가 `Disconnect`로 끝나지 않으면 스트림은 이후 영원히 대기합니다.
#[cfg(test)]
#[derive(Default)]
pub struct MockRuntimeClient {
    containers: std::sync::Mutex<Vec<RuntimeContainer>>,
    batches: std::sync::Mutex<std::collections::VecDeque<Vec<ScriptedEvent>>>,
    fail_list: bool,
    fail_ping: bool,
    subscribed_at: std::sync::Mutex<Vec<tokio::time::Instant>>,
}

#[cfg(test)]
impl MockRuntimeClient {
    /// 빈 mock 클라이언트를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 런타임에 존재하는 컨테이너를 설정합니다.
    pub fn with_containers(self, containers: Vec<RuntimeContainer>) -> Self {
        self.set_containers(containers);
        self
    }

    /// 다음 구독에서 방출할 이벤트 배치를 추가합니다.
    pub fn with_event_batch(self, batch: Vec<ScriptedEvent>) -> Self {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push_back(batch);
        }
        self
    }

    /// list_containers 호출이 실패하도록 설정합니다.
    pub fn with_failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    /// ping 호출이 실패하도록 설정합니다.
    pub fn with_failing_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    /// 컨테이너 목록을 교체합니다.
    pub fn set_containers(&self, containers: Vec<RuntimeContainer>) {
        if let Ok(mut guard) = self.containers.lock() {
            *guard = containers;
        }
    }

    /// 지금까지의 이벤트 구독 횟수
    pub fn subscriptions(&self) -> usize {
        self.subscription_times().len()
    }

    /// 각 구독 시점 (tokio 시계 기준)
    pub fn subscription_times(&self) -> Vec<tokio::time::Instant> {
        self.subscribed_at
            .lock()
            .map(|times| times.clone())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<RuntimeContainer> {
        self.containers.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl RuntimeClient for MockRuntimeClient {
    async fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> Result<Vec<RuntimeContainer>, NetworkGuardError> {
        if self.fail_list {
            return Err(NetworkGuardError::RuntimeApi("mock list failure".to_owned()));
        }
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|c| c.running)
            .filter(|c| filters.network.as_ref().is_none_or(|n| c.networks.contains_key(n)))
            .filter(|c| filters.label.as_ref().is_none_or(|l| c.labels.contains_key(l)))
            .filter(|c| filters.id.as_ref().is_none_or(|id| &c.id == id))
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, NetworkGuardError> {
        self.snapshot()
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| NetworkGuardError::ContainerNotFound(id.to_owned()))
    }

    fn events(
        &self,
        _filters: &EventFilters,
    ) -> BoxStream<'static, Result<RuntimeEvent, NetworkGuardError>> {
        if let Ok(mut times) = self.subscribed_at.lock() {
            times.push(tokio::time::Instant::now());
        }
        let batch = self
            .batches
            .lock()
            .ok()
            .and_then(|mut b| b.pop_front())
            .unwrap_or_default();
        let ends = matches!(batch.last(), Some(ScriptedEvent::Disconnect(_)));
        let items = futures::stream::iter(batch.into_iter().map(|item| match item {
            ScriptedEvent::Event(event) => Ok(event),
            ScriptedEvent::Decode(msg) => Err(NetworkGuardError::EventDecode(msg)),
            ScriptedEvent::Disconnect(msg) => Err(NetworkGuardError::EventStream(msg)),
        }));
        if ends {
            items.boxed()
        } else {
            items.chain(futures::stream::pending()).boxed()
        }
    }

    async fn ping(&self) -> Result<(), NetworkGuardError> {
        if self.fail_ping {
            return Err(NetworkGuardError::RuntimeConnection("mock ping failure".to_owned()));
        }
        Ok(())
    }
}
