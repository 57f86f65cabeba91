//! Parsing and classification of ICE candidate descriptors.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Marker preceding the positional fields in a candidate descriptor.
const CANDIDATE_MARKER: &str = "candidate:";

/// Token offsets after the marker. The descriptor grammar is a fixed,
/// space-delimited positional encoding shared with the peer connection
/// capability. Changing these offsets breaks interoperability with the
/// emitting system.
const FIELD_PROTOCOL: usize = 2;
const FIELD_ADDRESS: usize = 4;
const FIELD_KIND: usize = 7;

/// Errors from [`Candidate::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCandidateError {
    /// The descriptor does not contain the `candidate:` marker.
    #[error("no 'candidate:' marker in descriptor")]
    MissingMarker,

    /// Fewer whitespace-delimited fields than the positional grammar requires.
    #[error("expected at least 8 candidate fields, got {0}")]
    TooFewFields(usize),

    /// The reachability class token is not one of host/prflx/srflx/relay.
    #[error("unknown candidate type: {0}")]
    UnknownKind(String),

    /// The transport token is not a known protocol.
    #[error("unknown candidate protocol: {0}")]
    UnknownProtocol(String),
}

/// Transport protocol of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// UDP
    Udp,
    /// TCP (see RFC 4571 for framing)
    Tcp,
    /// TCP with fixed SSL Hello Exchange
    SslTcp,
    /// TLS (only used via relay)
    Tls,
}

impl Protocol {
    fn from_token(t: &str) -> Option<Protocol> {
        if t.eq_ignore_ascii_case("udp") {
            Some(Protocol::Udp)
        } else if t.eq_ignore_ascii_case("tcp") {
            Some(Protocol::Tcp)
        } else if t.eq_ignore_ascii_case("ssltcp") {
            Some(Protocol::SslTcp)
        } else if t.eq_ignore_ascii_case("tls") {
            Some(Protocol::Tls)
        } else {
            None
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::SslTcp => "ssltcp",
            Protocol::Tls => "tls",
        };
        write!(f, "{x}")
    }
}

/// Reachability class of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Host (local network interface)
    Host,
    /// Prflx (peer reflexive)
    PeerReflexive,
    /// Srflx (STUN)
    ServerReflexive,
    /// Relay (TURN)
    Relayed,
}

impl CandidateKind {
    fn from_token(t: &str) -> Option<CandidateKind> {
        match t {
            "host" => Some(CandidateKind::Host),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "relay" => Some(CandidateKind::Relayed),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        };
        write!(f, "{x}")
    }
}

/// A parsed network path descriptor.
///
/// Candidates are discovered during session negotiation and describe one
/// way the two endpoints might reach each other: directly on a local
/// interface (host), through a NAT mapping observed by a public server
/// (server reflexive), or through a forwarding server (relay).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    kind: CandidateKind,
    proto: Protocol,
    addr: String,
    descriptor: String,
}

impl Candidate {
    /// Parses a candidate descriptor string.
    ///
    /// Only the reachability class, transport and address are extracted;
    /// the remaining positional fields (foundation, priority, port, ...)
    /// are kept in the raw descriptor but not interpreted.
    pub fn parse(descriptor: &str) -> Result<Candidate, ParseCandidateError> {
        let pos = descriptor
            .find(CANDIDATE_MARKER)
            .ok_or(ParseCandidateError::MissingMarker)?;
        let rest = &descriptor[pos + CANDIDATE_MARKER.len()..];

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() <= FIELD_KIND {
            return Err(ParseCandidateError::TooFewFields(fields.len()));
        }

        let proto = Protocol::from_token(fields[FIELD_PROTOCOL])
            .ok_or_else(|| ParseCandidateError::UnknownProtocol(fields[FIELD_PROTOCOL].into()))?;
        let kind = CandidateKind::from_token(fields[FIELD_KIND])
            .ok_or_else(|| ParseCandidateError::UnknownKind(fields[FIELD_KIND].into()))?;

        Ok(Candidate {
            kind,
            proto,
            addr: fields[FIELD_ADDRESS].to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    /// The reachability class.
    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    /// The transport protocol.
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// The address field. A bare IP address or hostname, without port.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The raw descriptor this candidate was parsed from.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// True for locally bound interface addresses.
    pub fn is_host(&self) -> bool {
        self.kind == CandidateKind::Host
    }

    /// True for NAT-mapped addresses observed by a public server.
    pub fn is_server_reflexive(&self) -> bool {
        self.kind == CandidateKind::ServerReflexive
    }

    /// True for addresses relayed through a forwarding server.
    pub fn is_relay(&self) -> bool {
        self.kind == CandidateKind::Relayed
    }

    /// True when the address is an IPv6 address.
    ///
    /// The address field never carries a port, so a colon can only be
    /// part of an IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        self.addr.contains(':')
    }

    /// True when the candidate transport is UDP.
    pub fn is_udp(&self) -> bool {
        self.proto == Protocol::Udp
    }

    /// True when the candidate transport is TCP.
    pub fn is_tcp(&self) -> bool {
        self.proto == Protocol::Tcp
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Candidate({}={}/{})", self.kind, self.addr, self.proto)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor)
    }
}

/// Serialize [`Candidate`] into browser-style candidate info.
///
/// e.g. serde_json would produce:
/// ```json
/// {
///  "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host",
///  "sdpMid": null,
///  "sdpMLineIndex": 0
/// }
/// ```
impl Serialize for Candidate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut o = serializer.serialize_struct("CandidateInfo", 3)?;
        o.serialize_field("candidate", &self.descriptor)?;
        o.serialize_field("sdpMid", &None::<()>)?;
        o.serialize_field("sdpMLineIndex", &0)?;
        o.end()
    }
}

/// Deserialize [`Candidate`] from candidate info. `sdpMid` and
/// `sdpMLineIndex` are dropped when parsing.
impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CandidateInfo {
            candidate: String,
        }

        let CandidateInfo { candidate } = CandidateInfo::deserialize(deserializer)?;
        Candidate::parse(&candidate).map_err(serde::de::Error::custom)
    }
}

/// Predicate over candidates, used to simulate a constrained network path.
///
/// Filters are a tagged enum rather than opaque closures so call sites can
/// ask which filter produced an outcome and customize their messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFilter {
    /// Admit every candidate.
    Any,
    /// Admit only host candidates.
    Host,
    /// Admit only server reflexive candidates.
    ServerReflexive,
    /// Admit only relayed candidates.
    Relay,
    /// Admit only candidates with an IPv6 address.
    Ipv6,
    /// Admit only UDP candidates.
    Udp,
    /// Admit only TCP candidates.
    Tcp,
}

impl CandidateFilter {
    /// Whether `candidate` passes this filter.
    pub fn admits(&self, candidate: &Candidate) -> bool {
        match self {
            CandidateFilter::Any => true,
            CandidateFilter::Host => candidate.is_host(),
            CandidateFilter::ServerReflexive => candidate.is_server_reflexive(),
            CandidateFilter::Relay => candidate.is_relay(),
            CandidateFilter::Ipv6 => candidate.is_ipv6(),
            CandidateFilter::Udp => candidate.is_udp(),
            CandidateFilter::Tcp => candidate.is_tcp(),
        }
    }
}

impl fmt::Display for CandidateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            CandidateFilter::Any => "any",
            CandidateFilter::Host => "host",
            CandidateFilter::ServerReflexive => "srflx",
            CandidateFilter::Relay => "relay",
            CandidateFilter::Ipv6 => "ipv6",
            CandidateFilter::Udp => "udp",
            CandidateFilter::Tcp => "tcp",
        };
        write!(f, "{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_candidate_by_fixed_offsets() {
        let c = Candidate::parse(
            "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host generation 0",
        )
        .unwrap();

        assert_eq!(c.kind(), CandidateKind::Host);
        assert_eq!(c.proto(), Protocol::Udp);
        assert_eq!(c.addr(), "10.0.0.1");
    }

    #[test]
    fn parse_recovers_all_synthetic_fields() {
        for (kind, kind_token) in [
            (CandidateKind::Host, "host"),
            (CandidateKind::PeerReflexive, "prflx"),
            (CandidateKind::ServerReflexive, "srflx"),
            (CandidateKind::Relayed, "relay"),
        ] {
            for (proto, proto_token) in [(Protocol::Udp, "udp"), (Protocol::Tcp, "tcp")] {
                let s = format!(
                    "candidate:4234997325 1 {proto_token} 2043278322 192.0.2.44 44323 typ {kind_token}"
                );
                let c = Candidate::parse(&s).unwrap();
                assert_eq!(c.kind(), kind);
                assert_eq!(c.proto(), proto);
                assert_eq!(c.addr(), "192.0.2.44");
                assert_eq!(c.descriptor(), s);
            }
        }
    }

    #[test]
    fn parse_with_attribute_prefix() {
        let c = Candidate::parse(
            "a=candidate:387183333 1 udp 1686052607 113.185.55.72 31267 typ srflx raddr 10.217.229.219 rport 50028",
        )
        .unwrap();
        assert_eq!(c.kind(), CandidateKind::ServerReflexive);
        assert_eq!(c.addr(), "113.185.55.72");
    }

    #[test]
    fn parse_rejects_malformed_descriptors() {
        assert_eq!(
            Candidate::parse("1 1 udp 2122260223 10.0.0.1 54321 typ host"),
            Err(ParseCandidateError::MissingMarker)
        );
        assert_eq!(
            Candidate::parse("candidate:12344 bad value"),
            Err(ParseCandidateError::TooFewFields(3))
        );
        assert_eq!(
            Candidate::parse("candidate:1 1 quic 2122260223 10.0.0.1 54321 typ host"),
            Err(ParseCandidateError::UnknownProtocol("quic".into()))
        );
        assert_eq!(
            Candidate::parse("candidate:1 1 udp 2122260223 10.0.0.1 54321 typ bogus"),
            Err(ParseCandidateError::UnknownKind("bogus".into()))
        );
    }

    #[test]
    fn kind_predicates_are_mutually_exclusive() {
        for kind in ["host", "srflx", "relay", "prflx"] {
            let s = format!("candidate:1 1 udp 2122260223 10.0.0.1 54321 typ {kind}");
            let c = Candidate::parse(&s).unwrap();
            let hits = [c.is_host(), c.is_server_reflexive(), c.is_relay()]
                .iter()
                .filter(|v| **v)
                .count();
            // prflx matches none of the three, every other kind exactly one.
            assert_eq!(hits, if kind == "prflx" { 0 } else { 1 });
        }
    }

    #[test]
    fn ipv6_classification() {
        let v6 = Candidate::parse(
            "candidate:1 1 udp 2122260223 2001:db8::1 54321 typ host",
        )
        .unwrap();
        let v4 = Candidate::parse("candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host").unwrap();

        assert!(v6.is_ipv6());
        assert!(!v4.is_ipv6());
        assert!(CandidateFilter::Ipv6.admits(&v6));
        assert!(!CandidateFilter::Ipv6.admits(&v4));
    }

    #[test]
    fn filters_match_their_tag() {
        let relay_tcp = Candidate::parse(
            "candidate:1 1 tcp 16776959 203.0.113.7 3478 typ relay raddr 0.0.0.0 rport 0",
        )
        .unwrap();

        assert!(CandidateFilter::Any.admits(&relay_tcp));
        assert!(CandidateFilter::Relay.admits(&relay_tcp));
        assert!(CandidateFilter::Tcp.admits(&relay_tcp));
        assert!(!CandidateFilter::Udp.admits(&relay_tcp));
        assert!(!CandidateFilter::Host.admits(&relay_tcp));
        assert!(!CandidateFilter::ServerReflexive.admits(&relay_tcp));
    }

    #[test]
    fn serialize_deserialize_candidate_info() {
        let s = "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host";
        let c1 = Candidate::parse(s).unwrap();

        let json = serde_json::to_string(&c1).unwrap();
        assert_eq!(
            json,
            r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host","sdpMid":null,"sdpMLineIndex":0}"#
        );

        let c2: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(c1, c2);
    }
}
