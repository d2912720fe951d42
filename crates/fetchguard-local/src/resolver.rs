//! C2 — Secure Resolver: DNS lookup with a hard timeout, rejecting any
//! address that is not globally routable.
//!
//! Grounded on the SSRF validation in the `webfetch` tool of the pack's
//! agent-monorepo example: `tokio::net::lookup_host` plus hand-rolled CIDR
//! matching, with no extra DNS/CIDR crate.
use fetchguard_core::{ErrorKind, FetchError, Stage};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Preference applied to a host's resolved addresses before they're handed
/// to the fetcher, which tries them in order. `Verbatim` (the default)
/// keeps whatever order the resolver returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOrder {
    Verbatim,
    Ipv4First,
    Ipv6First,
}

impl DnsOrder {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4first" => DnsOrder::Ipv4First,
            "ipv6first" => DnsOrder::Ipv6First,
            _ => DnsOrder::Verbatim,
        }
    }

    fn apply(self, mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
        match self {
            DnsOrder::Verbatim => ips,
            DnsOrder::Ipv4First => {
                ips.sort_by_key(|ip| !ip.is_ipv4());
                ips
            }
            DnsOrder::Ipv6First => {
                ips.sort_by_key(|ip| !ip.is_ipv6());
                ips
            }
        }
    }
}

struct Cidr {
    network: IpAddr,
    prefix: u8,
}

/// Non-globally-routable ranges: RFC1918, loopback, link-local, ULA,
/// multicast, broadcast, the IETF special-use blocks, and documentation
/// ranges.
fn blocked_cidrs() -> &'static [(&'static str, u8)] {
    &[
        ("127.0.0.0", 8),
        ("10.0.0.0", 8),
        ("172.16.0.0", 12),
        ("192.168.0.0", 16),
        ("169.254.0.0", 16),
        ("0.0.0.0", 8),
        ("100.64.0.0", 10),
        ("192.0.0.0", 24),
        ("192.0.2.0", 24),
        ("198.51.100.0", 24),
        ("203.0.113.0", 24),
        ("224.0.0.0", 4),
        ("240.0.0.0", 4),
        ("255.255.255.255", 32),
        ("::1", 128),
        ("::", 128),
        ("fc00::", 7),
        ("fe80::", 10),
        ("ff00::", 8),
    ]
}

fn parsed_blocked_cidrs() -> Vec<Cidr> {
    blocked_cidrs()
        .iter()
        .filter_map(|(addr, prefix)| {
            addr.parse::<IpAddr>().ok().map(|network| Cidr { network, prefix: *prefix })
        })
        .collect()
}

fn prefix_match(ip: &[u8], net: &[u8], prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let full = (prefix / 8) as usize;
    let rem = prefix % 8;
    if ip.len() < full || net.len() < full || ip[..full] != net[..full] {
        return false;
    }
    if rem == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - rem);
    ip[full] & mask == net[full] & mask
}

fn ip_in_cidr(ip: IpAddr, cidr: &Cidr) -> bool {
    match (ip, cidr.network) {
        (IpAddr::V4(a), IpAddr::V4(b)) => prefix_match(&a.octets(), &b.octets(), cidr.prefix),
        (IpAddr::V6(a), IpAddr::V6(b)) => prefix_match(&a.octets(), &b.octets(), cidr.prefix),
        _ => false,
    }
}

/// True if `ip` is anything other than a globally routable unicast address.
pub fn is_blocked_address(ip: IpAddr) -> bool {
    if ip.is_multicast() {
        return true;
    }
    let mapped = match ip {
        IpAddr::V6(v6) => v6.to_ipv4().map(IpAddr::V4).unwrap_or(ip),
        other => other,
    };
    parsed_blocked_cidrs().iter().any(|cidr| ip_in_cidr(mapped, cidr) || ip_in_cidr(ip, cidr))
}

/// Resolves `host:port` to its A/AAAA records with a hard 5 s timeout,
/// rejecting the lookup if any resolved address is non-globally-routable.
/// `cancel` races the DNS future; if it resolves first the preflight fails
/// with `ABORTED` (HTTP-equivalent 499).
pub async fn resolve_secure(
    host: &str,
    port: u16,
    cancel: &CancellationToken,
    order: DnsOrder,
) -> Result<Vec<IpAddr>, FetchError> {
    let lookup = tokio::net::lookup_host((host, port));

    let resolved = tokio::select! {
        res = timeout(RESOLVE_TIMEOUT, lookup) => res,
        _ = cancel.cancelled() => return Err(FetchError::aborted().with_stage(Stage::DnsPreflight).with_url(host)),
    };

    let addrs = resolved
        .map_err(|_| FetchError::timeout(Stage::DnsPreflight).with_url(host))?
        .map_err(|e| {
            FetchError::new(ErrorKind::DnsTimeout, format!("dns lookup failed: {e}"))
                .with_stage(Stage::DnsPreflight)
                .with_url(host)
        })?;

    let ips: Vec<IpAddr> = order.apply(addrs.map(|a| a.ip()).collect());
    if ips.is_empty() {
        return Err(FetchError::new(ErrorKind::Enodata, "dns lookup returned no addresses")
            .with_stage(Stage::DnsPreflight)
            .with_url(host));
    }

    if let Some(blocked) = ips.iter().find(|ip| is_blocked_address(**ip)) {
        return Err(FetchError::new(ErrorKind::Eblocked, format!("resolved address {blocked} is not publicly routable"))
            .with_stage(Stage::DnsPreflight)
            .with_url(host));
    }

    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn loopback_is_blocked() {
        assert!(is_blocked_address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
    }

    #[test]
    fn link_local_metadata_ip_is_blocked() {
        assert!(is_blocked_address(IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254))));
    }

    #[test]
    fn private_rfc1918_is_blocked() {
        assert!(is_blocked_address(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(is_blocked_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn public_address_is_allowed() {
        assert!(!is_blocked_address(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }

    #[test]
    fn ipv4_first_sorts_v4_before_v6() {
        let ips = vec![
            IpAddr::V6(std::net::Ipv6Addr::new(0x2606, 0x2800, 0x220, 1, 0x248, 0x1893, 0x25c8, 0x1946)),
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        ];
        let ordered = DnsOrder::Ipv4First.apply(ips);
        assert!(ordered[0].is_ipv4());
    }

    #[tokio::test]
    async fn ssrf_target_is_rejected() {
        let token = CancellationToken::new();
        let err = resolve_secure("169.254.169.254", 80, &token, DnsOrder::Verbatim).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Eblocked);
    }
}
