//! Peer locator codec.
//!
//! A peer is addressed by a self-describing locator:
//!
//! ```text
//! kni://<node id hex>@<host>:<port>[?discport=<port>][&ntype=<role>]
//! ```
//!
//! The node id is the hex form of the peer's 32-byte public identity. IPv6
//! hosts are written in brackets. Unknown query keys are ignored so newer
//! peers can add fields without breaking older parsers.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use kni_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};

/// URI scheme of peer locators.
pub const LOCATOR_SCHEME: &str = "kni";

/// Role a node plays in the network, carried in the `ntype` query key.
///
/// Roles are built by parsing a tag, so a role always survives a trip
/// through a locator: the four known tags map to named variants and any
/// other tag must be a non-empty run of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeRole {
    /// Consensus node (`cn`).
    Consensus,
    /// Proxy node (`pn`).
    Proxy,
    /// Endpoint node (`en`).
    Endpoint,
    /// Bootnode (`bn`).
    Boot,
    /// Any other tag, kept verbatim.
    Other(RoleTag),
}

/// A tag that names none of the known roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleTag(String);

impl RoleTag {
    /// The tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl NodeRole {
    /// The wire tag for this role.
    pub fn as_str(&self) -> &str {
        match self {
            NodeRole::Consensus => "cn",
            NodeRole::Proxy => "pn",
            NodeRole::Endpoint => "en",
            NodeRole::Boot => "bn",
            NodeRole::Other(tag) => tag.as_str(),
        }
    }
}

fn is_role_token(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = P2pError;

    fn from_str(s: &str) -> P2pResult<Self> {
        match s {
            "cn" => Ok(NodeRole::Consensus),
            "pn" => Ok(NodeRole::Proxy),
            "en" => Ok(NodeRole::Endpoint),
            "bn" => Ok(NodeRole::Boot),
            tag if is_role_token(tag) => Ok(NodeRole::Other(RoleTag(tag.to_string()))),
            tag => Err(P2pError::MalformedAddress(format!("invalid node type {:?}", tag))),
        }
    }
}

impl TryFrom<String> for NodeRole {
    type Error = P2pError;

    fn try_from(tag: String) -> P2pResult<Self> {
        tag.parse()
    }
}

impl From<NodeRole> for String {
    fn from(role: NodeRole) -> Self {
        role.as_str().to_string()
    }
}

/// Everything needed to reach and recognise one peer.
///
/// Two descriptors with the same `id` name the same logical peer even when
/// their transport addresses differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    /// Public identity of the peer.
    pub id: NodeId,
    /// IP address or DNS name, without IPv6 brackets.
    pub host: String,
    /// TCP port of the peer's listener.
    pub port: u16,
    /// UDP discovery port. Equals `port` unless stated otherwise.
    pub discovery_port: u16,
    /// Advertised role, if any.
    pub role: Option<NodeRole>,
}

impl PeerDescriptor {
    /// Create a descriptor whose discovery port equals its TCP port.
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            discovery_port: port,
            role: None,
        }
    }

    /// Set the discovery port.
    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Parse a locator string.
    pub fn parse(locator: &str) -> P2pResult<Self> {
        parse(locator)
    }

    /// `host:port` suitable for `TcpStream::connect`, bracketing IPv6 hosts.
    pub fn transport_addr(&self) -> String {
        format!("{}:{}", bracket_host(&self.host), self.port)
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(self))
    }
}

impl FromStr for PeerDescriptor {
    type Err = P2pError;

    fn from_str(s: &str) -> P2pResult<Self> {
        parse(s)
    }
}

fn malformed(locator: &str, reason: &str) -> P2pError {
    P2pError::MalformedAddress(format!("{}: {}", reason, locator))
}

/// Parse a `kni://` locator into a descriptor.
pub fn parse(locator: &str) -> P2pResult<PeerDescriptor> {
    let rest = locator
        .strip_prefix(LOCATOR_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| malformed(locator, "expected kni:// scheme"))?;

    let (id_part, rest) = rest
        .split_once('@')
        .ok_or_else(|| malformed(locator, "missing node id"))?;
    if id_part.is_empty() {
        return Err(malformed(locator, "missing node id"));
    }
    let id = NodeId::from_hex(id_part)
        .map_err(|e| P2pError::MalformedAddress(format!("invalid node id ({}): {}", e, locator)))?;

    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };

    let (host, port) = split_host_port(authority).ok_or_else(|| malformed(locator, "invalid host:port"))?;

    let mut descriptor = PeerDescriptor::new(id, host, port);

    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "discport" => {
                descriptor.discovery_port = value
                    .parse()
                    .map_err(|_| malformed(locator, "invalid discport"))?;
            }
            "ntype" if !value.is_empty() => {
                descriptor.role = Some(
                    value
                        .parse()
                        .map_err(|_| malformed(locator, "invalid ntype"))?,
                );
            }
            _ => {}
        }
    }

    Ok(descriptor)
}

/// Serialize a descriptor back into its locator string.
pub fn format(d: &PeerDescriptor) -> String {
    let mut out = format!("{}://{}@{}", LOCATOR_SCHEME, d.id.to_hex(), d.transport_addr());
    let mut sep = '?';
    if d.discovery_port != d.port {
        out.push_str(&format!("{}discport={}", sep, d.discovery_port));
        sep = '&';
    }
    if let Some(role) = &d.role {
        out.push_str(&format!("{}ntype={}", sep, role));
    }
    out
}

fn bracket_host(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn split_host_port(authority: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        (host, after.strip_prefix(':')?)
    } else {
        let (host, port) = authority.rsplit_once(':')?;
        if host.parse::<Ipv4Addr>().is_err() && !is_valid_hostname(host) {
            return None;
        }
        (host, port)
    };
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id_hex() -> String {
        "abcd".repeat(16)
    }

    #[test]
    fn test_parse_full_locator() {
        let locator = format!("kni://{}@3.38.95.49:32324?discport=0&ntype=cn", test_id_hex());
        let d = parse(&locator).unwrap();

        assert_eq!(d.id.to_hex(), test_id_hex());
        assert_eq!(d.host, "3.38.95.49");
        assert_eq!(d.port, 32324);
        assert_eq!(d.discovery_port, 0);
        assert_eq!(d.role, Some(NodeRole::Consensus));
    }

    #[test]
    fn test_discport_defaults_to_port() {
        let d = parse(&format!("kni://{}@10.0.0.1:32323", test_id_hex())).unwrap();
        assert_eq!(d.discovery_port, 32323);
        assert_eq!(d.role, None);
    }

    #[test]
    fn test_unknown_query_keys_ignored() {
        let d = parse(&format!("kni://{}@10.0.0.1:32323?foo=bar&ntype=pn&x", test_id_hex())).unwrap();
        assert_eq!(d.role, Some(NodeRole::Proxy));
        assert_eq!(d.discovery_port, 32323);
    }

    #[test]
    fn test_ipv6_and_hostname_hosts() {
        let d = parse(&format!("kni://{}@[::1]:30303", test_id_hex())).unwrap();
        assert_eq!(d.host, "::1");
        assert_eq!(d.transport_addr(), "[::1]:30303");

        let d = parse(&format!("kni://{}@seed-1.example.org:30303", test_id_hex())).unwrap();
        assert_eq!(d.host, "seed-1.example.org");
    }

    #[test]
    fn test_malformed_locators() {
        let id = test_id_hex();
        let cases = [
            format!("enode://{}@1.2.3.4:30303", id),
            "kni://1.2.3.4:30303".to_string(),
            "kni://@1.2.3.4:30303".to_string(),
            format!("kni://{}@1.2.3.4", id),
            format!("kni://{}@1.2.3.4:99999", id),
            format!("kni://{}@1.2.3.4:port", id),
            format!("kni://{}@::1:30303", id),
            format!("kni://{}@bad_host:30303", id),
            format!("kni://{}@1.2.3.4:30303?discport=x", id),
            format!("kni://{}@1.2.3.4:30303", &id[..60]),
            format!("kni://{}@1.2.3.4:30303?ntype=a%26b", id),
            "kni://zz@1.2.3.4:30303".to_string(),
        ];

        for case in &cases {
            assert!(
                matches!(parse(case), Err(P2pError::MalformedAddress(_))),
                "expected MalformedAddress for {}",
                case
            );
        }
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let id = NodeId::from_hex(&test_id_hex()).unwrap();
        let descriptors = [
            PeerDescriptor::new(id, "3.38.95.49", 32324)
                .with_discovery_port(0)
                .with_role(NodeRole::Consensus),
            PeerDescriptor::new(id, "::1", 30303),
            PeerDescriptor::new(id, "node.local", 1).with_role("xn".parse().unwrap()),
            PeerDescriptor::new(id, "node.local", 2).with_role("edge_2-b".parse().unwrap()),
        ];

        for d in &descriptors {
            assert_eq!(&parse(&format(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_format_is_canonical() {
        let locator = format!("kni://{}@3.38.95.49:32324?discport=0&ntype=cn", test_id_hex());
        assert_eq!(parse(&locator).unwrap().to_string(), locator);

        // A discport equal to the port is implied.
        let verbose = format!("kni://{}@3.38.95.49:32324?discport=32324", test_id_hex());
        let canonical = format!("kni://{}@3.38.95.49:32324", test_id_hex());
        assert_eq!(parse(&verbose).unwrap().to_string(), canonical);
    }

    #[test]
    fn test_role_tags_normalize() {
        assert_eq!("cn".parse::<NodeRole>().unwrap(), NodeRole::Consensus);
        assert_eq!("bn".parse::<NodeRole>().unwrap(), NodeRole::Boot);

        let other: NodeRole = "xn".parse().unwrap();
        assert!(matches!(&other, NodeRole::Other(tag) if tag.as_str() == "xn"));
        assert_eq!(other.to_string(), "xn");

        for bad in ["", "a&b", "a=b", "a b", "c?n"] {
            assert!(bad.parse::<NodeRole>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_role_wire_form_is_the_tag() {
        let bytes = kni_core::serialization::serialize(&NodeRole::Consensus).unwrap();
        let text = kni_core::serialization::serialize(&"cn".to_string()).unwrap();
        assert_eq!(bytes, text);

        let forged = kni_core::serialization::serialize(&"a&b".to_string()).unwrap();
        assert!(kni_core::serialization::deserialize::<NodeRole>(&forged).is_err());

        let known = kni_core::serialization::serialize(&"en".to_string()).unwrap();
        let role: NodeRole = kni_core::serialization::deserialize(&known).unwrap();
        assert_eq!(role, NodeRole::Endpoint);
    }

    #[test]
    fn test_rejects_64_byte_identity() {
        // Locators with 64-byte (uncompressed secp256k1) identities name
        // peers we cannot authenticate.
        let locator = "kni://8318535b54105d4a7aae60c08fc45f9687181b4fdfc625bd1a753fa7397fed75\
                       3547f11ca8696646f2f3acb08e31016afac23e630c5d11f59f61fef57b0d2aa5\
                       @3.38.95.49:32324?discport=0&ntype=cn";
        assert!(matches!(parse(locator), Err(P2pError::MalformedAddress(_))));

        let truncated = "kni://8318535b54105d4a7aae60c08fc45f9687181b4fdfc625bd1a753fa7397fed75\
                         @3.38.95.49:32324?discport=0&ntype=cn";
        assert_eq!(parse(truncated).unwrap().port, 32324);
    }
}
