// src/target.rs - Target specification resolution
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ScanError, ScanResult};

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$").unwrap()
});

static OCTET_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3})\.(\d{1,3})-(\d{1,3})$").unwrap()
});

/// A single host selected for scanning, with an optional port-range
/// restriction. Hostnames are passed through unresolved; DNS is the scan
/// tool's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub ports: Option<String>,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: None,
        }
    }

    pub fn with_ports(host: impl Into<String>, ports: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: Some(ports.into()),
        }
    }

    /// Canonical string form used for deduplication.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ports {
            Some(ports) => write!(f, "{}:{}", self.host, ports),
            None => write!(f, "{}", self.host),
        }
    }
}

/// One parsed element of a comma-separated spec, before expansion.
enum SpecElement {
    Single(Target),
    Cidr(IpNetwork, Option<String>),
    Range(Ipv4Addr, Ipv4Addr, Option<String>),
}

impl SpecElement {
    /// Number of targets this element expands to. Computed before any
    /// materialization so oversized specs never allocate.
    fn expansion_count(&self) -> u64 {
        match self {
            SpecElement::Single(_) => 1,
            SpecElement::Cidr(network, _) => {
                let host_bits = match network {
                    IpNetwork::V4(n) => 32 - n.prefix() as u32,
                    IpNetwork::V6(n) => 128 - n.prefix() as u32,
                };
                if host_bits >= 63 {
                    u64::MAX
                } else {
                    1u64 << host_bits
                }
            }
            SpecElement::Range(start, end, _) => {
                u64::from(u32::from(*end)) - u64::from(u32::from(*start)) + 1
            }
        }
    }
}

/// Expands raw target specifications into deduplicated target sequences.
pub struct TargetResolver {
    max_targets: usize,
}

impl TargetResolver {
    pub fn new(max_targets: usize) -> Self {
        Self { max_targets }
    }

    /// Resolve a raw spec into an ordered, deduplicated target list.
    ///
    /// Grammar: single IP, hostname, CIDR block, last-octet dash range,
    /// and comma lists of those; any element may carry a `:ports` suffix.
    pub fn resolve(&self, raw_spec: &str) -> ScanResult<Vec<Target>> {
        let raw_spec = raw_spec.trim();
        if raw_spec.is_empty() {
            return Err(ScanError::InvalidTargetSpec("empty target spec".to_string()));
        }

        let mut elements = Vec::new();
        for part in raw_spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(ScanError::InvalidTargetSpec(format!(
                    "empty element in spec '{}'", raw_spec
                )));
            }
            elements.push(Self::parse_element(part)?);
        }

        // Reject oversized specs before expanding anything.
        let requested: u64 = elements.iter().map(|e| e.expansion_count()).fold(0, u64::saturating_add);
        if requested > self.max_targets as u64 {
            return Err(ScanError::TargetSetTooLarge {
                requested: requested.min(usize::MAX as u64) as usize,
                limit: self.max_targets,
            });
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for element in elements {
            Self::expand_into(element, &mut seen, &mut targets);
        }

        debug!("Resolved '{}' into {} targets", raw_spec, targets.len());
        Ok(targets)
    }

    fn expand_into(element: SpecElement, seen: &mut HashSet<String>, out: &mut Vec<Target>) {
        let mut push = |target: Target| {
            if seen.insert(target.canonical()) {
                out.push(target);
            }
        };

        match element {
            SpecElement::Single(target) => push(target),
            SpecElement::Cidr(network, ports) => {
                for ip in network.iter() {
                    push(Target {
                        host: ip.to_string(),
                        ports: ports.clone(),
                    });
                }
            }
            SpecElement::Range(start, end, ports) => {
                let mut current = u32::from(start);
                let last = u32::from(end);
                while current <= last {
                    push(Target {
                        host: Ipv4Addr::from(current).to_string(),
                        ports: ports.clone(),
                    });
                    if current == u32::MAX {
                        break;
                    }
                    current += 1;
                }
            }
        }
    }

    fn parse_element(part: &str) -> ScanResult<SpecElement> {
        let (host_part, ports) = Self::split_port_suffix(part)?;

        // CIDR block
        if host_part.contains('/') {
            let network = IpNetwork::from_str(host_part).map_err(|e| {
                ScanError::InvalidTargetSpec(format!("invalid CIDR '{}': {}", host_part, e))
            })?;
            return Ok(SpecElement::Cidr(network, ports));
        }

        // Dash range, either full (a.b.c.d-a.b.c.e) or last-octet (a.b.c.d-e)
        if let Some(caps) = OCTET_RANGE_RE.captures(host_part) {
            let prefix = &caps[1];
            let start: Ipv4Addr = format!("{}.{}", prefix, &caps[2]).parse().map_err(|_| {
                ScanError::InvalidTargetSpec(format!("invalid range start in '{}'", host_part))
            })?;
            let end: Ipv4Addr = format!("{}.{}", prefix, &caps[3]).parse().map_err(|_| {
                ScanError::InvalidTargetSpec(format!("invalid range end in '{}'", host_part))
            })?;
            if start > end {
                return Err(ScanError::InvalidTargetSpec(format!(
                    "descending range '{}'", host_part
                )));
            }
            return Ok(SpecElement::Range(start, end, ports));
        }
        if let Some((left, right)) = host_part.split_once('-') {
            if let (Ok(start), Ok(end)) = (left.parse::<Ipv4Addr>(), right.parse::<Ipv4Addr>()) {
                if start > end {
                    return Err(ScanError::InvalidTargetSpec(format!(
                        "descending range '{}'", host_part
                    )));
                }
                return Ok(SpecElement::Range(start, end, ports));
            }
        }

        // Single address
        if let Ok(ip) = host_part.parse::<IpAddr>() {
            return Ok(SpecElement::Single(Target {
                host: ip.to_string(),
                ports,
            }));
        }

        // Purely numeric dotted forms that failed IP parsing are typos,
        // not hostnames.
        if host_part.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(ScanError::InvalidTargetSpec(format!(
                "'{}' is not a valid IP address", host_part
            )));
        }

        // Hostname
        if host_part.len() <= 253 && HOSTNAME_RE.is_match(host_part) {
            return Ok(SpecElement::Single(Target {
                host: host_part.to_ascii_lowercase(),
                ports,
            }));
        }

        Err(ScanError::InvalidTargetSpec(format!(
            "'{}' matches no supported target grammar", part
        )))
    }

    /// Split an optional `:ports` suffix off a spec element. IPv6 literals
    /// are left alone; their colons are part of the address.
    fn split_port_suffix(part: &str) -> ScanResult<(&str, Option<String>)> {
        let Some((host, suffix)) = part.rsplit_once(':') else {
            return Ok((part, None));
        };
        if host.contains(':') || host.is_empty() {
            // IPv6 literal, or nothing before the colon
            return Ok((part, None));
        }
        crate::options::validate_port_spec(suffix)
            .map_err(|e| ScanError::InvalidTargetSpec(format!("{} in '{}'", e, part)))?;
        Ok((host, Some(suffix.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TargetResolver {
        TargetResolver::new(1024)
    }

    #[test]
    fn resolves_single_ip() {
        let targets = resolver().resolve("192.168.1.5").unwrap();
        assert_eq!(targets, vec![Target::new("192.168.1.5")]);
    }

    #[test]
    fn resolves_cidr_with_expected_count() {
        let targets = resolver().resolve("192.168.1.0/30").unwrap();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["192.168.1.0", "192.168.1.1", "192.168.1.2", "192.168.1.3"]);
    }

    #[test]
    fn resolves_last_octet_range() {
        let targets = resolver().resolve("10.0.0.10-12").unwrap();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
    }

    #[test]
    fn resolves_full_ip_range() {
        let targets = resolver().resolve("10.0.0.254-10.0.1.1").unwrap();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn comma_list_preserves_first_occurrence_order() {
        let targets = resolver()
            .resolve("10.0.0.2, scanme.example.org, 10.0.0.1-3")
            .unwrap();
        let forms: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        assert_eq!(forms, vec!["10.0.0.2", "scanme.example.org", "10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn hostnames_dedupe_case_insensitively() {
        let targets = resolver().resolve("Scanme.Example.Org,scanme.example.org").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host, "scanme.example.org");
    }

    #[test]
    fn port_suffix_is_captured() {
        let targets = resolver().resolve("10.0.0.1:22-80").unwrap();
        assert_eq!(targets, vec![Target::with_ports("10.0.0.1", "22-80")]);
    }

    #[test]
    fn ipv6_literal_is_not_split_on_colon() {
        let targets = resolver().resolve("::1").unwrap();
        assert_eq!(targets[0].host, "::1");
    }

    #[test]
    fn oversized_cidr_is_rejected_without_partial_output() {
        let err = TargetResolver::new(256).resolve("10.0.0.0/8").unwrap_err();
        match err {
            ScanError::TargetSetTooLarge { limit, requested } => {
                assert_eq!(limit, 256);
                assert_eq!(requested, 1 << 24);
            }
            other => panic!("expected TargetSetTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn oversized_total_across_comma_list_is_rejected() {
        let err = TargetResolver::new(6).resolve("10.0.0.0/30,10.0.1.0/30").unwrap_err();
        assert!(matches!(err, ScanError::TargetSetTooLarge { requested: 8, limit: 6 }));
    }

    #[test]
    fn garbage_specs_are_invalid() {
        for spec in ["", "  ", "999.1.2.3", "10.0.0.5-2", "a,,b", "bad port:99999", "-dash-start-"] {
            let err = resolver().resolve(spec).unwrap_err();
            assert!(
                matches!(err, ScanError::InvalidTargetSpec(_)),
                "spec '{}' produced {:?}", spec, err
            );
        }
    }
}
