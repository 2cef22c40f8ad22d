//! 포트 의도 계산 -- DNAT 레이블 파싱과 마킹 대상 포트 선별
//!
//! # DNAT 레이블 형식
//! 쉼표로 구분된 `port[/protocol]` 토큰 목록입니다.
//! 프로토콜을 생략하면 `tcp`이며 대소문자를 구분하지 않습니다.
//!
//! ```text
//! "80,443/tcp,53/UDP"  ->  80/tcp, 443/tcp, 53/udp
//! ```
//!
//! 잘못된 토큰은 건너뛰고 [`ParsedPorts::malformed`]에 모아 호출자가 로깅합니다.

use std::fmt;

use netwarden_core::types::{PortMapping, Protocol};

use crate::error::NetworkGuardError;

/// 단일 포트 규칙 의도 (포트 번호 + 프로토콜)
///
/// 전이마다 계산되며 저장되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortIntent {
    /// 포트 번호
    pub port: u16,
    /// 프로토콜
    pub protocol: Protocol,
}

impl PortIntent {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for PortIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// DNAT 레이블 파싱 결과
#[derive(Debug, Default)]
pub struct ParsedPorts {
    /// 유효한 포트 의도 (입력 순서 유지)
    pub intents: Vec<PortIntent>,
    /// 거부된 토큰별 에러
    pub malformed: Vec<NetworkGuardError>,
}

/// 쉼표로 구분된 포트 목록을 파싱합니다.
///
/// 공백은 제거되고 빈 토큰은 무시됩니다. 중복 토큰은 그대로 유지됩니다.
pub fn parse_ports(value: &str) -> ParsedPorts {
    let mut parsed = ParsedPorts::default();
    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match parse_port_token(token) {
            Ok(intent) => parsed.intents.push(intent),
            Err(e) => parsed.malformed.push(e),
        }
    }
    parsed
}

/// 단일 `port[/protocol]` 토큰을 파싱합니다.
///
/// # Errors
///
/// 포트가 `u16` 범위 밖이거나 0인 경우, `/` 뒤 프로토콜이 비어 있거나
/// 영숫자가 아닌 문자를 포함한 경우 `NetworkGuardError::InvalidPort`를 반환합니다.
pub fn parse_port_token(token: &str) -> Result<PortIntent, NetworkGuardError> {
    let invalid = |reason: &str| NetworkGuardError::InvalidPort {
        token: token.to_owned(),
        reason: reason.to_owned(),
    };

    let (port_part, protocol_part) = match token.split_once('/') {
        Some((port, proto)) => (port.trim(), Some(proto.trim())),
        None => (token, None),
    };

    if !port_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a port number"));
    }
    let port = port_part
        .parse::<u16>()
        .map_err(|_| invalid("not a port number"))?;
    if port == 0 {
        return Err(invalid("port must be non-zero"));
    }

    let protocol = match protocol_part {
        None => Protocol::Tcp,
        Some("") => return Err(invalid("empty protocol")),
        Some(proto) if !proto.chars().all(|c| c.is_ascii_alphanumeric()) => {
            return Err(invalid("protocol must be alphanumeric"));
        }
        Some(proto) => Protocol::from(proto),
    };

    Ok(PortIntent::new(port, protocol))
}

/// DNAT 의도에 포함되지 않은 게시 포트를 마킹 의도로 반환합니다.
///
/// 게시 포트의 호스트 포트와 프로토콜이 모두 같은 DNAT 의도가 있으면 제외합니다.
/// 결과는 게시 포트 순서를 따릅니다.
pub fn mark_intents(published: &[PortMapping], dnat: &[PortIntent]) -> Vec<PortIntent> {
    published
        .iter()
        .filter(|p| {
            !dnat
                .iter()
                .any(|d| d.port == p.host_port && d.protocol == p.protocol)
        })
        .map(|p| PortIntent::new(p.host_port, p.protocol.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(host_port: u16, protocol: Protocol) -> PortMapping {
        PortMapping {
            host_ip: Some("0.0.0.0".to_owned()),
            host_port,
            container_port: host_port,
            protocol,
        }
    }

    #[test]
    fn parses_ports_with_default_protocol() {
        let parsed = parse_ports("80,443/tcp,53/udp");
        assert!(parsed.malformed.is_empty());
        assert_eq!(
            parsed.intents,
            vec![
                PortIntent::new(80, Protocol::Tcp),
                PortIntent::new(443, Protocol::Tcp),
                PortIntent::new(53, Protocol::Udp),
            ]
        );
    }

    #[test]
    fn skips_malformed_tokens() {
        let parsed = parse_ports("80,bad,53");
        assert_eq!(
            parsed.intents,
            vec![
                PortIntent::new(80, Protocol::Tcp),
                PortIntent::new(53, Protocol::Tcp),
            ]
        );
        assert_eq!(parsed.malformed.len(), 1);
        assert!(matches!(
            &parsed.malformed[0],
            NetworkGuardError::InvalidPort { token, .. } if token == "bad"
        ));
    }

    #[test]
    fn trims_whitespace_and_ignores_empty_tokens() {
        let parsed = parse_ports(" 80 , ,  443/udp ,");
        assert!(parsed.malformed.is_empty());
        assert_eq!(
            parsed.intents,
            vec![
                PortIntent::new(80, Protocol::Tcp),
                PortIntent::new(443, Protocol::Udp),
            ]
        );
    }

    #[test]
    fn protocol_is_case_insensitive() {
        let parsed = parse_ports("53/UDP,132/Sctp");
        assert_eq!(parsed.intents[0].protocol, Protocol::Udp);
        assert_eq!(parsed.intents[1].protocol, Protocol::Sctp);
    }

    #[test]
    fn unknown_alphanumeric_protocol_passes_through() {
        let intent = parse_port_token("9000/dccp").unwrap();
        assert_eq!(intent.protocol, Protocol::Other("dccp".to_owned()));
        assert_eq!(intent.to_string(), "9000/dccp");
    }

    #[test]
    fn rejects_out_of_range_and_zero() {
        assert!(parse_port_token("65536").is_err());
        assert!(parse_port_token("0").is_err());
        assert!(parse_port_token("-1").is_err());
        assert!(parse_port_token("65535").is_ok());
    }

    #[test]
    fn rejects_signed_port() {
        assert!(parse_port_token("+80").is_err());
        assert!(parse_port_token("+80/tcp").is_err());
        let parsed = parse_ports("+80,443");
        assert_eq!(parsed.intents, vec![PortIntent::new(443, Protocol::Tcp)]);
        assert_eq!(parsed.malformed.len(), 1);
    }

    #[test]
    fn rejects_bad_protocol() {
        assert!(parse_port_token("80/").is_err());
        assert!(parse_port_token("80/t-cp").is_err());
        assert!(parse_port_token("80/tcp/udp").is_err());
    }

    #[test]
    fn empty_value_yields_nothing() {
        let parsed = parse_ports("");
        assert!(parsed.intents.is_empty());
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn duplicate_tokens_are_kept() {
        let parsed = parse_ports("80,80");
        assert_eq!(parsed.intents.len(), 2);
    }

    #[test]
    fn mark_excludes_dnat_ports() {
        let ports = vec![published(80, Protocol::Tcp), published(443, Protocol::Tcp)];
        let dnat = vec![PortIntent::new(443, Protocol::Tcp)];
        assert_eq!(
            mark_intents(&ports, &dnat),
            vec![PortIntent::new(80, Protocol::Tcp)]
        );
    }

    #[test]
    fn mark_requires_protocol_match_to_exclude() {
        let ports = vec![published(53, Protocol::Tcp)];
        let dnat = vec![PortIntent::new(53, Protocol::Udp)];
        assert_eq!(
            mark_intents(&ports, &dnat),
            vec![PortIntent::new(53, Protocol::Tcp)]
        );
    }

    #[test]
    fn mark_uses_host_port() {
        let ports = vec![PortMapping {
            host_ip: None,
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
        }];
        assert_eq!(
            mark_intents(&ports, &[PortIntent::new(80, Protocol::Tcp)]),
            vec![PortIntent::new(8080, Protocol::Tcp)]
        );
    }
}
