//! Destination checks: which hosts a call may name, and which resolved
//! addresses it may connect to.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::Serialize;

use crate::config::ConfigError;

/// Classification of a resolved address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClass {
    Public,
    Unspecified,
    Loopback,
    LinkLocal,
    /// Cloud instance metadata endpoints
    Metadata,
    /// RFC 1918
    Private,
    /// RFC 6598 carrier-grade NAT
    SharedAddressSpace,
    /// IPv6 fc00::/7
    UniqueLocal,
    /// RFC 2544 / RFC 5180
    Benchmarking,
    Multicast,
    Broadcast,
    Documentation,
    Reserved,
}

impl AddressClass {
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }

    /// Whether a configured allowance may re-permit this class.
    pub fn is_permittable(&self) -> bool {
        matches!(
            self,
            Self::Private | Self::SharedAddressSpace | Self::UniqueLocal | Self::Benchmarking
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unspecified => "unspecified",
            Self::Loopback => "loopback",
            Self::LinkLocal => "link-local",
            Self::Metadata => "metadata",
            Self::Private => "private",
            Self::SharedAddressSpace => "shared address space",
            Self::UniqueLocal => "unique-local",
            Self::Benchmarking => "benchmarking",
            Self::Multicast => "multicast",
            Self::Broadcast => "broadcast",
            Self::Documentation => "documentation",
            Self::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for AddressClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPv4 address carried inside an IPv6 one (mapped, NAT64, 6to4).
fn embedded_v4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let s = ip.segments();
    // 64:ff9b::/96
    if s[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        return Some(Ipv4Addr::new(
            (s[6] >> 8) as u8,
            s[6] as u8,
            (s[7] >> 8) as u8,
            s[7] as u8,
        ));
    }
    // 2002::/16
    if s[0] == 0x2002 {
        return Some(Ipv4Addr::new(
            (s[1] >> 8) as u8,
            s[1] as u8,
            (s[2] >> 8) as u8,
            s[2] as u8,
        ));
    }
    None
}

/// The address that decides classification: IPv6 forms embedding an IPv4
/// address are reduced to it.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => embedded_v4(&v6).map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

pub fn classify(ip: IpAddr) -> AddressClass {
    match canonical(ip) {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    let o = ip.octets();
    match o {
        [169, 254, 169, 254] | [100, 100, 100, 200] | [192, 0, 0, 192] => AddressClass::Metadata,
        [0, ..] => AddressClass::Unspecified,
        [127, ..] => AddressClass::Loopback,
        [169, 254, ..] => AddressClass::LinkLocal,
        [10, ..] | [192, 168, ..] => AddressClass::Private,
        [172, b, ..] if (16..32).contains(&b) => AddressClass::Private,
        [100, b, ..] if (64..128).contains(&b) => AddressClass::SharedAddressSpace,
        [198, 18 | 19, ..] => AddressClass::Benchmarking,
        [192, 0, 2, _] | [198, 51, 100, _] | [203, 0, 113, _] => AddressClass::Documentation,
        [192, 0, 0, _] => AddressClass::Reserved,
        [255, 255, 255, 255] => AddressClass::Broadcast,
        [224..=239, ..] => AddressClass::Multicast,
        [240..=255, ..] => AddressClass::Reserved,
        _ => AddressClass::Public,
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddressClass {
    let s = ip.segments();
    if ip.is_unspecified() {
        return AddressClass::Unspecified;
    }
    if ip.is_loopback() {
        return AddressClass::Loopback;
    }
    // fd00:ec2::254
    if s == [0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254] {
        return AddressClass::Metadata;
    }
    match s[0] {
        x if x & 0xffc0 == 0xfe80 => AddressClass::LinkLocal,
        x if x & 0xffc0 == 0xfec0 => AddressClass::Reserved,
        x if x & 0xfe00 == 0xfc00 => AddressClass::UniqueLocal,
        x if x & 0xff00 == 0xff00 => AddressClass::Multicast,
        0x2001 if s[1] == 0x0db8 => AddressClass::Documentation,
        0x2001 if s[1] == 0x0002 && s[2] == 0 => AddressClass::Benchmarking,
        0x2001 if s[1] < 0x0200 => AddressClass::Reserved,
        x if x & 0xe000 == 0x2000 => AddressClass::Public,
        _ => AddressClass::Reserved,
    }
}

// ============================================================================
// Address policy
// ============================================================================

/// Which non-public ranges an operator has re-permitted
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    allowances: Vec<IpNet>,
}

impl AddressPolicy {
    /// Parse CIDR allowances. Only permittable classes can be re-permitted;
    /// a range touching loopback, link-local or metadata space is refused.
    pub fn from_config(ranges: &[String]) -> Result<Self, ConfigError> {
        let mut allowances = Vec::with_capacity(ranges.len());
        for range in ranges {
            let net: IpNet = range
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidRange(range.clone()))?;
            let first = classify(net.network());
            let last = classify(net.broadcast());
            if !first.is_permittable() || !last.is_permittable() {
                return Err(ConfigError::RangeNotPermittable(range.clone()));
            }
            allowances.push(net);
        }
        Ok(Self { allowances })
    }

    /// Check one resolved address, returning its class when rejected.
    pub fn check(&self, ip: IpAddr) -> Result<(), AddressClass> {
        let class = classify(ip);
        if class.is_public() {
            return Ok(());
        }
        let ip = canonical(ip);
        if class.is_permittable() && self.allowances.iter().any(|net| net.contains(&ip)) {
            return Ok(());
        }
        Err(class)
    }
}

// ============================================================================
// Host allowlist
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    Exact(String),
    /// Stored with its leading dot
    Suffix(String),
}

/// Hosts a call may name. An empty list permits nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowlist {
    patterns: Vec<HostPattern>,
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl HostAllowlist {
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Accepts `host`, `*.suffix` and `*`. Blank patterns are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| {
                let p = normalize_host(p.as_ref());
                if p == "*" {
                    Some(HostPattern::Any)
                } else if let Some(suffix) = p.strip_prefix("*.") {
                    (!suffix.is_empty()).then(|| HostPattern::Suffix(format!(".{suffix}")))
                } else if p.is_empty() || p.contains('*') {
                    None
                } else {
                    Some(HostPattern::Exact(p))
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn permits(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.patterns.iter().any(|p| match p {
            HostPattern::Any => true,
            HostPattern::Exact(exact) => *exact == host,
            HostPattern::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(s: &str) -> AddressClass {
        classify(s.parse().unwrap())
    }

    #[test]
    fn classifies_ipv4_ranges() {
        assert_eq!(class("93.184.216.34"), AddressClass::Public);
        assert_eq!(class("127.0.0.1"), AddressClass::Loopback);
        assert_eq!(class("169.254.169.254"), AddressClass::Metadata);
        assert_eq!(class("169.254.1.1"), AddressClass::LinkLocal);
        assert_eq!(class("10.1.2.3"), AddressClass::Private);
        assert_eq!(class("172.31.255.255"), AddressClass::Private);
        assert_eq!(class("172.32.0.1"), AddressClass::Public);
        assert_eq!(class("100.64.0.1"), AddressClass::SharedAddressSpace);
        assert_eq!(class("0.0.0.0"), AddressClass::Unspecified);
        assert_eq!(class("224.0.0.1"), AddressClass::Multicast);
        assert_eq!(class("255.255.255.255"), AddressClass::Broadcast);
        assert_eq!(class("198.18.0.1"), AddressClass::Benchmarking);
    }

    #[test]
    fn classifies_ipv6_and_embedded_ipv4() {
        assert_eq!(class("2606:4700::1111"), AddressClass::Public);
        assert_eq!(class("::1"), AddressClass::Loopback);
        assert_eq!(class("fe80::1"), AddressClass::LinkLocal);
        assert_eq!(class("fd12:3456::1"), AddressClass::UniqueLocal);
        assert_eq!(class("fd00:ec2::254"), AddressClass::Metadata);
        assert_eq!(class("::ffff:127.0.0.1"), AddressClass::Loopback);
        assert_eq!(class("::ffff:169.254.169.254"), AddressClass::Metadata);
        assert_eq!(class("64:ff9b::a9fe:a9fe"), AddressClass::Metadata);
        assert_eq!(class("2002:7f00:1::"), AddressClass::Loopback);
        assert_eq!(class("2001:db8::1"), AddressClass::Documentation);
        assert_eq!(class("ff02::1"), AddressClass::Multicast);
    }

    #[test]
    fn allowances_only_reopen_permittable_ranges() {
        let policy = AddressPolicy::from_config(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(policy.check("10.2.3.4".parse().unwrap()).is_ok());
        assert!(policy.check("::ffff:10.2.3.4".parse().unwrap()).is_ok());
        assert_eq!(
            policy.check("192.168.1.1".parse().unwrap()),
            Err(AddressClass::Private)
        );
        assert_eq!(
            policy.check("127.0.0.1".parse().unwrap()),
            Err(AddressClass::Loopback)
        );

        assert!(matches!(
            AddressPolicy::from_config(&["127.0.0.0/8".to_string()]),
            Err(ConfigError::RangeNotPermittable(_))
        ));
        assert!(matches!(
            AddressPolicy::from_config(&["169.254.0.0/16".to_string()]),
            Err(ConfigError::RangeNotPermittable(_))
        ));
        assert!(matches!(
            AddressPolicy::from_config(&["not a range".to_string()]),
            Err(ConfigError::InvalidRange(_))
        ));
    }

    #[test]
    fn host_patterns() {
        let list = HostAllowlist::new(["API.example.com.", "*.svc.example.org", "", "bad*"]);
        assert!(list.permits("api.example.com"));
        assert!(list.permits("Api.Example.Com."));
        assert!(list.permits("a.svc.example.org"));
        assert!(!list.permits("svc.example.org"));
        assert!(!list.permits("evilsvc.example.org"));
        assert!(!list.permits("example.com"));

        assert!(HostAllowlist::new(["*"]).permits("anything.test"));
        assert!(!HostAllowlist::deny_all().permits("example.com"));
    }
}
