//! 역경로 워밍업 -- 새 컨테이너 IP로의 연결을 재시도해 커널 라우팅 상태를 준비
//!
//! 게시 포트가 있으면 첫 번째 포트로 전송 계층 프로브(TCP 연결, UDP 빈 데이터그램)를
//! 먼저 시도하고, 모두 실패하면 ICMP echo로 폴백합니다.
//! 게시 포트가 없거나 전송 프로브가 없는 프로토콜이면 바로 ICMP를 사용합니다.
//!
//! 워밍업 실패는 로그만 남기며 이후 규칙 적용을 막지 않습니다.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netwarden_core::types::{PortMapping, Protocol};

/// 워밍업 재시도 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPolicy {
    /// 프로브 방식별 최대 시도 횟수
    pub max_attempts: u32,
    /// 시도 간 대기 시간
    pub interval: Duration,
    /// 시도당 타임아웃
    pub attempt_timeout: Duration,
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(1),
        }
    }
}

/// 프로브 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// TCP 연결
    Tcp(SocketAddr),
    /// UDP 연결 후 빈 데이터그램 전송
    Udp(SocketAddr),
    /// ICMP echo
    Icmp(IpAddr),
}

impl ProbeTarget {
    /// 게시 포트에 대한 전송 계층 프로브 대상. TCP/UDP 외에는 `None`입니다.
    pub fn transport(ip: IpAddr, port: &PortMapping) -> Option<Self> {
        let addr = SocketAddr::new(ip, port.container_port);
        match port.protocol {
            Protocol::Tcp => Some(Self::Tcp(addr)),
            Protocol::Udp => Some(Self::Udp(addr)),
            _ => None,
        }
    }

    /// 로그용 방식 이름
    pub fn method(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            Self::Icmp(_) => "icmp",
        }
    }
}

/// 단일 프로브 시도를 수행하는 trait
///
/// 프로덕션은 [`NetProber`], 테스트는 스크립트된 구현을 사용합니다.
pub trait Prober: Send + Sync + 'static {
    /// 대상에 한 번 프로브합니다. 타임아웃은 호출자가 적용합니다.
    fn probe(&self, target: &ProbeTarget) -> impl Future<Output = io::Result<()>> + Send;
}

/// 소켓과 시스템 `ping`을 사용하는 프로버
#[derive(Debug, Clone)]
pub struct NetProber {
    ping_path: String,
    icmp_wait_secs: u64,
}

impl NetProber {
    /// 새 프로버를 생성합니다. `attempt_timeout`은 `ping -W` 값으로 쓰입니다.
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            ping_path: "ping".to_owned(),
            icmp_wait_secs: attempt_timeout.as_secs().max(1),
        }
    }

    /// ICMP 프로브에 사용할 `ping` 경로를 지정합니다.
    pub fn with_ping_path(mut self, path: impl Into<String>) -> Self {
        self.ping_path = path.into();
        self
    }
}

impl Prober for NetProber {
    async fn probe(&self, target: &ProbeTarget) -> io::Result<()> {
        match target {
            ProbeTarget::Tcp(addr) => {
                let _stream = tokio::net::TcpStream::connect(addr).await?;
                Ok(())
            }
            ProbeTarget::Udp(addr) => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = tokio::net::UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                socket.send(&[]).await?;
                Ok(())
            }
            ProbeTarget::Icmp(ip) => {
                let status = tokio::process::Command::new(&self.ping_path)
                    .arg("-c")
                    .arg("1")
                    .arg("-W")
                    .arg(self.icmp_wait_secs.to_string())
                    .arg(ip.to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(io::Error::other(format!("no echo reply ({status})")))
                }
            }
        }
    }
}

/// 워밍업 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmupOutcome {
    /// 전송 계층 프로브 성공
    Transport {
        /// 성공한 시도 번호 (1부터)
        attempts: u32,
    },
    /// ICMP 프로브 성공
    Icmp {
        /// 성공한 시도 번호 (1부터)
        attempts: u32,
    },
    /// 모든 프로브 실패
    Failed,
    /// 취소됨
    Cancelled,
}

impl WarmupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Icmp { .. })
    }
}

enum RetryResult {
    Succeeded(u32),
    Exhausted,
    Cancelled,
}

/// 컨테이너 IP에 대해 워밍업을 수행합니다.
///
/// `first_port`는 컨테이너의 첫 번째 게시 포트입니다.
pub async fn warm_up<P: Prober>(
    prober: &P,
    policy: &WarmupPolicy,
    ip: IpAddr,
    first_port: Option<&PortMapping>,
    cancel: &CancellationToken,
) -> WarmupOutcome {
    if let Some(target) = first_port.and_then(|port| ProbeTarget::transport(ip, port)) {
        info!(%ip, method = target.method(), "warming up reverse path");
        match retry_probe(prober, policy, &target, cancel).await {
            RetryResult::Succeeded(attempts) => {
                info!(%ip, method = target.method(), attempts, "reverse path warmed up");
                return WarmupOutcome::Transport { attempts };
            }
            RetryResult::Cancelled => return WarmupOutcome::Cancelled,
            RetryResult::Exhausted => {
                warn!(
                    %ip,
                    method = target.method(),
                    max_attempts = policy.max_attempts,
                    "failed to warm up via port, falling back to icmp"
                );
            }
        }
    }

    let target = ProbeTarget::Icmp(ip);
    info!(%ip, method = "icmp", "warming up reverse path");
    match retry_probe(prober, policy, &target, cancel).await {
        RetryResult::Succeeded(attempts) => {
            info!(%ip, method = "icmp", attempts, "reverse path warmed up");
            WarmupOutcome::Icmp { attempts }
        }
        RetryResult::Cancelled => WarmupOutcome::Cancelled,
        RetryResult::Exhausted => {
            warn!(
                %ip,
                max_attempts = policy.max_attempts,
                "failed to warm up reverse path"
            );
            WarmupOutcome::Failed
        }
    }
}

async fn retry_probe<P: Prober>(
    prober: &P,
    policy: &WarmupPolicy,
    target: &ProbeTarget,
    cancel: &CancellationToken,
) -> RetryResult {
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return RetryResult::Cancelled;
        }

        match tokio::time::timeout(policy.attempt_timeout, prober.probe(target)).await {
            Ok(Ok(())) => return RetryResult::Succeeded(attempt),
            Ok(Err(e)) => {
                debug!(method = target.method(), attempt, error = %e, "probe failed");
            }
            Err(_) => {
                debug!(method = target.method(), attempt, "probe timed out");
            }
        }

        if attempt < policy.max_attempts {
            tokio::select! {
                () = cancel.cancelled() => return RetryResult::Cancelled,
                () = tokio::time::sleep(policy.interval) => {}
            }
        }
    }
    RetryResult::Exhausted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 테스트용 프로버: 방식별로 N번째 시도부터 성공
    #[derive(Default)]
    pub struct ScriptedProber {
        /// 전송 프로브가 성공하는 시도 번호 (None이면 항상 실패)
        pub transport_succeeds_at: Option<u32>,
        /// ICMP 프로브가 성공하는 시도 번호 (None이면 항상 실패)
        pub icmp_succeeds_at: Option<u32>,
        transport_calls: AtomicU32,
        icmp_calls: AtomicU32,
        pub targets: Mutex<Vec<ProbeTarget>>,
    }

    impl ScriptedProber {
        pub fn always_ok() -> Self {
            Self {
                transport_succeeds_at: Some(1),
                icmp_succeeds_at: Some(1),
                ..Default::default()
            }
        }

        pub fn transport_calls(&self) -> u32 {
            self.transport_calls.load(Ordering::SeqCst)
        }

        pub fn icmp_calls(&self) -> u32 {
            self.icmp_calls.load(Ordering::SeqCst)
        }
    }

    impl Prober for ScriptedProber {
        async fn probe(&self, target: &ProbeTarget) -> io::Result<()> {
            self.targets.lock().unwrap().push(target.clone());
            let (calls, succeeds_at) = match target {
                ProbeTarget::Icmp(_) => (&self.icmp_calls, self.icmp_succeeds_at),
                _ => (&self.transport_calls, self.transport_succeeds_at),
            };
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            match succeeds_at {
                Some(at) if n >= at => Ok(()),
                _ => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        }
    }

    fn policy(max_attempts: u32) -> WarmupPolicy {
        WarmupPolicy {
            max_attempts,
            interval: Duration::from_millis(10),
            attempt_timeout: Duration::from_millis(10),
        }
    }

    fn port(container_port: u16, protocol: Protocol) -> PortMapping {
        PortMapping {
            host_ip: None,
            host_port: 8000 + container_port,
            container_port,
            protocol,
        }
    }

    fn ip() -> IpAddr {
        "172.17.0.2".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn tcp_probe_targets_first_container_port() {
        let prober = ScriptedProber::always_ok();
        let outcome = warm_up(
            &prober,
            &policy(3),
            ip(),
            Some(&port(80, Protocol::Tcp)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WarmupOutcome::Transport { attempts: 1 });
        assert_eq!(
            prober.targets.lock().unwrap()[0],
            ProbeTarget::Tcp("172.17.0.2:80".parse().unwrap())
        );
        assert_eq!(prober.icmp_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_retries_until_success() {
        let prober = ScriptedProber {
            transport_succeeds_at: Some(3),
            ..Default::default()
        };
        let outcome = warm_up(
            &prober,
            &policy(5),
            ip(),
            Some(&port(53, Protocol::Udp)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WarmupOutcome::Transport { attempts: 3 });
        assert_eq!(prober.transport_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_icmp_after_transport_exhausted() {
        let prober = ScriptedProber {
            transport_succeeds_at: None,
            icmp_succeeds_at: Some(2),
            ..Default::default()
        };
        let outcome = warm_up(
            &prober,
            &policy(4),
            ip(),
            Some(&port(80, Protocol::Tcp)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WarmupOutcome::Icmp { attempts: 2 });
        assert_eq!(prober.transport_calls(), 4);
        assert_eq!(prober.icmp_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_ports_goes_straight_to_icmp() {
        let prober = ScriptedProber::always_ok();
        let outcome = warm_up(&prober, &policy(3), ip(), None, &CancellationToken::new()).await;

        assert_eq!(outcome, WarmupOutcome::Icmp { attempts: 1 });
        assert_eq!(prober.transport_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sctp_port_goes_straight_to_icmp() {
        let prober = ScriptedProber::always_ok();
        let outcome = warm_up(
            &prober,
            &policy(3),
            ip(),
            Some(&port(132, Protocol::Sctp)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WarmupOutcome::Icmp { attempts: 1 });
        assert_eq!(prober.transport_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_probes_failing_reports_failed() {
        let prober = ScriptedProber::default();
        let outcome = warm_up(
            &prober,
            &policy(2),
            ip(),
            Some(&port(80, Protocol::Tcp)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WarmupOutcome::Failed);
        assert!(!outcome.is_success());
        assert_eq!(prober.transport_calls(), 2);
        assert_eq!(prober.icmp_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retry_loop() {
        let prober = ScriptedProber::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = warm_up(&prober, &policy(60), ip(), None, &cancel).await;
        assert_eq!(outcome, WarmupOutcome::Cancelled);
        assert_eq!(prober.icmp_calls(), 0);
    }

    #[tokio::test]
    async fn tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let prober = NetProber::new(Duration::from_secs(1));
        prober.probe(&ProbeTarget::Tcp(addr)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_ping_binary_is_probe_error() {
        let prober = NetProber::new(Duration::from_secs(1)).with_ping_path("/nonexistent/ping");
        let result = prober.probe(&ProbeTarget::Icmp(ip())).await;
        assert!(result.is_err());
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = WarmupPolicy::default();
        assert_eq!(policy.max_attempts, 60);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(1));
    }
}
