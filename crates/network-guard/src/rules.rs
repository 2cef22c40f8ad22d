//! 방화벽 규칙 실행 -- iptables 명령 생성과 실행
//!
//! 각 규칙은 설치(`-A`)와 철회(`-D`) 쌍으로 표현됩니다.
//!
//! ```text
//! mangle  PREROUTING -p P --sport N -j MARK --set-mark M
//! nat     PREROUTING -p P --dport N -j DNAT --to-destination IP:N
//! filter  FORWARD    -p P -d IP --dport N -j ACCEPT
//! ```
//!
//! 호출마다 iptables 프로세스 하나를 실행하며 실패는 호출 단위로 보고됩니다.
//! 롤백이나 재시도는 하지 않습니다.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use netwarden_core::types::Protocol;

use crate::error::NetworkGuardError;

/// 규칙 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    /// 규칙 추가 (`-A`)
    Install,
    /// 규칙 삭제 (`-D`)
    Retract,
}

impl RuleAction {
    /// iptables 플래그
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Install => "-A",
            Self::Retract => "-D",
        }
    }

    /// 메트릭/로그용 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Retract => "retract",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 단일 방화벽 규칙
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FirewallRule {
    /// 게시 포트에서 나가는 패킷 마킹 (mangle PREROUTING, `--sport`)
    Mark {
        /// 프로토콜
        protocol: Protocol,
        /// 호스트 포트
        port: u16,
        /// `--set-mark` 값
        mark: String,
    },
    /// 포트를 컨테이너로 DNAT (nat PREROUTING, `--dport`)
    Dnat {
        /// 프로토콜
        protocol: Protocol,
        /// 포트 (목적지 포트도 동일)
        port: u16,
        /// 컨테이너 IP
        destination: IpAddr,
    },
    /// DNAT된 트래픽 전달 허용 (filter FORWARD)
    ForwardAccept {
        /// 프로토콜
        protocol: Protocol,
        /// 목적지 포트
        port: u16,
        /// 컨테이너 IP
        destination: IpAddr,
    },
}

impl FirewallRule {
    /// 메트릭 레이블용 규칙 종류
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Mark { .. } => "mark",
            Self::Dnat { .. } => "dnat",
            Self::ForwardAccept { .. } => "forward",
        }
    }

    /// 규칙의 포트
    pub fn port(&self) -> u16 {
        match self {
            Self::Mark { port, .. } | Self::Dnat { port, .. } | Self::ForwardAccept { port, .. } => {
                *port
            }
        }
    }

    /// 규칙의 프로토콜
    pub fn protocol(&self) -> &Protocol {
        match self {
            Self::Mark { protocol, .. }
            | Self::Dnat { protocol, .. }
            | Self::ForwardAccept { protocol, .. } => protocol,
        }
    }

    /// iptables 인자 목록을 생성합니다.
    pub fn args(&self, action: RuleAction) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(14);
        match self {
            Self::Mark {
                protocol,
                port,
                mark,
            } => {
                args.extend(["-t", "mangle", action.flag(), "PREROUTING"].map(String::from));
                args.extend(["-p".to_owned(), protocol.to_string()]);
                args.extend(["--sport".to_owned(), port.to_string()]);
                args.extend(["-j", "MARK", "--set-mark"].map(String::from));
                args.push(mark.clone());
            }
            Self::Dnat {
                protocol,
                port,
                destination,
            } => {
                args.extend(["-t", "nat", action.flag(), "PREROUTING"].map(String::from));
                args.extend(["-p".to_owned(), protocol.to_string()]);
                args.extend(["--dport".to_owned(), port.to_string()]);
                args.extend(["-j", "DNAT", "--to-destination"].map(String::from));
                args.push(socket_string(*destination, *port));
            }
            Self::ForwardAccept {
                protocol,
                port,
                destination,
            } => {
                args.extend([action.flag(), "FORWARD"].map(String::from));
                args.extend(["-p".to_owned(), protocol.to_string()]);
                args.extend(["-d".to_owned(), destination.to_string()]);
                args.extend(["--dport".to_owned(), port.to_string()]);
                args.extend(["-j", "ACCEPT"].map(String::from));
            }
        }
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mark {
                protocol,
                port,
                mark,
            } => write!(f, "mangle PREROUTING {port}/{protocol} mark={mark}"),
            Self::Dnat {
                protocol,
                port,
                destination,
            } => write!(
                f,
                "nat PREROUTING {port}/{protocol} -> {}",
                socket_string(*destination, *port)
            ),
            Self::ForwardAccept {
                protocol,
                port,
                destination,
            } => write!(f, "FORWARD {port}/{protocol} -> {destination}"),
        }
    }
}

fn socket_string(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

/// 방화벽 규칙 실행 trait
///
/// 프로덕션은 [`IptablesExecutor`]를 사용하고 테스트는 호출을 기록하는 mock을 사용합니다.
pub trait RuleExecutor: Send + Sync + 'static {
    /// 규칙 하나를 설치하거나 철회합니다.
    ///
    /// # Errors
    ///
    /// 명령 실행 실패, 0이 아닌 종료 코드, 타임아웃 시
    /// `NetworkGuardError::RuleFailed`를 반환합니다.
    fn apply(
        &self,
        action: RuleAction,
        rule: &FirewallRule,
    ) -> impl Future<Output = Result<(), NetworkGuardError>> + Send;
}

/// `iptables` 바이너리를 실행하는 규칙 실행기
#[derive(Debug, Clone)]
pub struct IptablesExecutor {
    path: String,
    timeout: Duration,
}

impl IptablesExecutor {
    /// 새 실행기를 생성합니다.
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl RuleExecutor for IptablesExecutor {
    async fn apply(&self, action: RuleAction, rule: &FirewallRule) -> Result<(), NetworkGuardError> {
        let args = rule.args(action);
        debug!(iptables = %self.path, args = %args.join(" "), "executing iptables");

        let failed = |reason: String| NetworkGuardError::RuleFailed {
            rule: rule.to_string(),
            reason,
        };

        let command = tokio::process::Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| failed(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| failed(format!("failed to execute {}: {e}", self.path)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }

        Ok(())
    }
}

/// 테스트용 Mock 규칙 실행기
///
/// 모든 호출을 순서대로 기록하며, 지정한 규칙 종류는 실패시킵니다.
#[cfg(test)]
#[derive(Default)]
pub struct MockRuleExecutor {
    calls: std::sync::Mutex<Vec<(RuleAction, FirewallRule)>>,
    fail_kinds: Vec<&'static str>,
}

#[cfg(test)]
impl MockRuleExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 해당 종류(`mark`, `dnat`, `forward`)의 규칙 실행을 실패시킵니다.
    pub fn failing_kind(mut self, kind: &'static str) -> Self {
        self.fail_kinds.push(kind);
        self
    }

    /// 기록된 호출 목록
    pub fn calls(&self) -> Vec<(RuleAction, FirewallRule)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl RuleExecutor for MockRuleExecutor {
    async fn apply(&self, action: RuleAction, rule: &FirewallRule) -> Result<(), NetworkGuardError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((action, rule.clone()));
        }
        if self.fail_kinds.contains(&rule.kind_name()) {
            return Err(NetworkGuardError::RuleFailed {
                rule: rule.to_string(),
                reason: "mock failure".to_owned(),
            });
        }
        Ok(())
    }
}
