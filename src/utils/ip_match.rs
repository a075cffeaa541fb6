//! IPv4 allowlist matching: exact addresses and CIDR blocks (spec.md §4.1).

use std::net::Ipv4Addr;

/// Returns `true` if `ip` matches `entry`, where `entry` is either a bare
/// dotted-quad address or a `a.b.c.d/N` CIDR block. Invalid prefix bits
/// (outside `0..=32`) or an unparsable entry never match.
pub fn matches(entry: &str, ip: Ipv4Addr) -> bool {
    match entry.split_once('/') {
        Some((addr, bits)) => match (addr.parse::<Ipv4Addr>(), bits.parse::<u32>()) {
            (Ok(network), Ok(prefix)) if prefix <= 32 => {
                let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (u32::from(network) & mask) == (u32::from(ip) & mask)
            }
            _ => false,
        },
        None => entry.parse::<Ipv4Addr>().map(|addr| addr == ip).unwrap_or(false),
    }
}

/// Empty allowlist means "allow any IP" per spec.md §4.1/§4.2.
pub fn check_allowlist(allowlist: &[String], ip: Option<Ipv4Addr>) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    match ip {
        Some(ip) => allowlist.iter().any(|entry| matches(entry, ip)),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("10.0.0.1", "10.0.0.1".parse().unwrap()));
        assert!(!matches("10.0.0.1", "10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_slash_zero_allows_all() {
        assert!(matches("0.0.0.0/0", "8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn cidr_slash_32_is_exact() {
        assert!(matches("10.0.0.5/32", "10.0.0.5".parse().unwrap()));
        assert!(!matches("10.0.0.5/32", "10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn cidr_slash_8_contains_block() {
        assert!(matches("10.0.0.0/8", "10.50.25.100".parse().unwrap()));
        assert!(!matches("10.0.0.0/8", "11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn invalid_prefix_bits_never_match() {
        assert!(!matches("10.0.0.0/33", "10.0.0.1".parse().unwrap()));
        assert!(!matches("10.0.0.0/-1", "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        assert!(check_allowlist(&[], Some("1.2.3.4".parse().unwrap())));
    }
}
