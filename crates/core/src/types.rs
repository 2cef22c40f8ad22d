//! 도메인 타입: 시스템 전역에서 사용되는 공통 타입
//!
//! 상태 추적기와 정책 조정기가 공유하는 컨테이너/포트 데이터 구조를 정의합니다.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// 전송 계층 프로토콜
///
/// `tcp`, `udp`, `sctp` 외의 이름은 `Other`로 보존되어
/// 방화벽 도구에 그대로 전달됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
    /// 기타 프로토콜 (소문자 이름)
    Other(String),
}

impl Protocol {
    /// iptables `-p` 인자로 쓰이는 소문자 이름을 반환합니다.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Protocol {
    fn from(value: &str) -> Self {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "sctp" => Self::Sctp,
            _ => Self::Other(lower),
        }
    }
}

impl From<String> for Protocol {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 호스트에 게시된 포트 매핑
///
/// 공개 포트가 0이 아닌 매핑만 레코드에 포함됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// 바인딩된 호스트 IP (런타임이 보고한 경우)
    pub host_ip: Option<String>,
    /// 호스트 포트
    pub host_port: u16,
    /// 컨테이너 포트
    pub container_port: u16,
    /// 프로토콜
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// 감시 네트워크에 연결된 컨테이너의 스냅샷
///
/// 상태 추적기의 디렉토리가 소유하며, 전이 이벤트에는 복사본이 담깁니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// 컨테이너 ID
    pub id: String,
    /// 표시 이름 (선행 `/` 제거)
    pub name: String,
    /// 감시 네트워크 이름
    pub network: String,
    /// 감시 네트워크상의 IP 주소
    pub ip_address: Option<IpAddr>,
    /// 게시된 포트 매핑
    pub ports: Vec<PortMapping>,
    /// 컨테이너 레이블
    pub labels: HashMap<String, String>,
}

impl ContainerRecord {
    /// 로그용 12자리 짧은 ID를 반환합니다.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// 레이블 값을 조회합니다.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

impl fmt::Display for ContainerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self
            .ip_address
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_owned());
        write!(
            f,
            "{} ({}) network={} ip={} ports={}",
            self.name,
            self.short_id(),
            self.network,
            ip,
            self.ports.len(),
        )
    }
}

/// 컨테이너 ID를 12자리로 자릅니다.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ContainerRecord {
        ContainerRecord {
            id: "0123456789abcdef0123".to_owned(),
            name: "web".to_owned(),
            network: "bridge".to_owned(),
            ip_address: Some("172.17.0.5".parse().unwrap()),
            ports: vec![PortMapping {
                host_ip: Some("0.0.0.0".to_owned()),
                host_port: 8080,
                container_port: 80,
                protocol: Protocol::Tcp,
            }],
            labels: HashMap::from([("network.enable".to_owned(), "true".to_owned())]),
        }
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!(Protocol::from("TCP"), Protocol::Tcp);
        assert_eq!(Protocol::from("Udp"), Protocol::Udp);
        assert_eq!(Protocol::from("sctp"), Protocol::Sctp);
        assert_eq!(Protocol::from("DCCP"), Protocol::Other("dccp".to_owned()));
    }

    #[test]
    fn protocol_display_is_lowercase() {
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Other("dccp".to_owned()).to_string(), "dccp");
    }

    #[test]
    fn protocol_serializes_as_string() {
        let json = serde_json::to_string(&Protocol::Udp).unwrap();
        assert_eq!(json, "\"udp\"");
        let parsed: Protocol = serde_json::from_str("\"SCTP\"").unwrap();
        assert_eq!(parsed, Protocol::Sctp);
    }

    #[test]
    fn short_id_truncates_long_ids() {
        let record = sample_record();
        assert_eq!(record.short_id(), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn record_label_lookup() {
        let record = sample_record();
        assert_eq!(record.label("network.enable"), Some("true"));
        assert_eq!(record.label("missing"), None);
    }

    #[test]
    fn record_display_contains_key_fields() {
        let display = sample_record().to_string();
        assert!(display.contains("web"));
        assert!(display.contains("0123456789ab"));
        assert!(display.contains("172.17.0.5"));
    }

    #[test]
    fn port_mapping_display() {
        let mapping = PortMapping {
            host_ip: None,
            host_port: 5353,
            container_port: 53,
            protocol: Protocol::Udp,
        };
        assert_eq!(mapping.to_string(), "5353->53/udp");
    }
}
