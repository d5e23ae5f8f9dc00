//! NAT external-IP mappings
//!
//! Operators can pin the external address candidates advertised during
//! path gathering. Each mapping is `<IP>` or `<IP>/<iface-or-IP>`; a
//! right-hand interface name resolves to that interface's first
//! non-loopback IPv4. One malformed element invalidates the entire list,
//! so a half-applied mapping never reaches the gatherer.

use std::net::IpAddr;

use tracing::warn;

use overlink_net::IfaceLookup;

/// Normalize the configured mapping list.
///
/// Returns `None` when any element is malformed: not a valid IP on the
/// left, more than one `/`, or a right-hand side that is neither an IP nor
/// a resolvable, non-blacklisted interface.
pub fn parse_nat_external_ip_mappings(
    mappings: &[String],
    iface_blacklist: &[String],
    lookup: &dyn IfaceLookup,
) -> Option<Vec<String>> {
    if mappings.is_empty() {
        return None;
    }

    let mut parsed = Vec::with_capacity(mappings.len());
    for entry in mappings {
        let parts: Vec<&str> = entry.split('/').collect();
        match parts.as_slice() {
            [ip] => {
                if ip.parse::<IpAddr>().is_err() {
                    warn!(entry = %entry, "invalid external IP mapping, ignoring the whole list");
                    return None;
                }
                parsed.push(entry.clone());
            }
            [external, local] => {
                if external.parse::<IpAddr>().is_err() {
                    warn!(entry = %entry, "invalid external IP in mapping, ignoring the whole list");
                    return None;
                }
                if local.parse::<IpAddr>().is_ok() {
                    parsed.push(entry.clone());
                    continue;
                }
                if iface_blacklist.iter().any(|b| b == local) {
                    warn!(
                        entry = %entry,
                        iface = %local,
                        "mapping names a blacklisted interface, ignoring the whole list"
                    );
                    return None;
                }
                match lookup.first_ipv4(local) {
                    Some(ip) => parsed.push(format!("{external}/{ip}")),
                    None => {
                        warn!(
                            entry = %entry,
                            iface = %local,
                            "mapping interface has no usable IPv4, ignoring the whole list"
                        );
                        return None;
                    }
                }
            }
            _ => {
                warn!(entry = %entry, "malformed external IP mapping, ignoring the whole list");
                return None;
            }
        }
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use overlink_net::StaticIfaceLookup;

    fn lookup() -> StaticIfaceLookup {
        StaticIfaceLookup::new()
            .with_iface(
                "eth0",
                vec![Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 5)],
            )
            .with_iface("lo", vec![Ipv4Addr::new(127, 0, 0, 1)])
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_list() {
        let parsed = parse_nat_external_ip_mappings(
            &strings(&["1.1.1.1", "8.8.8.8/eth0"]),
            &[],
            &lookup(),
        );
        assert_eq!(parsed, Some(strings(&["1.1.1.1", "8.8.8.8/10.0.0.5"])));
    }

    #[test]
    fn test_ip_slash_ip_is_kept_verbatim() {
        let parsed = parse_nat_external_ip_mappings(
            &strings(&["1.1.1.1/9.9.9.9"]),
            &[],
            &lookup(),
        );
        assert_eq!(parsed, Some(strings(&["1.1.1.1/9.9.9.9"])));
    }

    #[test]
    fn test_bare_interface_name_returns_none() {
        let parsed = parse_nat_external_ip_mappings(&strings(&["eth0"]), &[], &lookup());
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_invalid_ip_returns_none() {
        let parsed = parse_nat_external_ip_mappings(&strings(&["1.1.1.1000"]), &[], &lookup());
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_double_slash_returns_none() {
        let parsed = parse_nat_external_ip_mappings(
            &strings(&["1.1.1.1/10.10.10.1/eth0"]),
            &[],
            &lookup(),
        );
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_one_bad_entry_invalidates_all() {
        let parsed = parse_nat_external_ip_mappings(
            &strings(&["1.1.1.1", "8.8.8.8/eth7"]),
            &[],
            &lookup(),
        );
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_blacklisted_interface_returns_none() {
        let parsed = parse_nat_external_ip_mappings(
            &strings(&["8.8.8.8/eth0"]),
            &strings(&["eth0"]),
            &lookup(),
        );
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_loopback_only_interface_returns_none() {
        let parsed = parse_nat_external_ip_mappings(&strings(&["8.8.8.8/lo"]), &[], &lookup());
        assert_eq!(parsed, None);
    }
}
