// Identity normalization for network addresses.
//
// Every identity-keyed operation (slow mode, blocking, feedback dedup) goes
// through `normalize` so that the same client is recognized no matter which
// listener or header it arrived through.

use std::net::IpAddr;

/// Prefix the OS puts in front of IPv4 clients accepted on a dual-stack socket.
const IPV4_MAPPED_PREFIX: &str = "::ffff:";

/// Normalize a raw address string into an identity key.
///
/// Strips the IPv4-mapped-IPv6 prefix and surrounding whitespace. Returns
/// `None` when nothing usable is left.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = match trimmed.get(..IPV4_MAPPED_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(IPV4_MAPPED_PREFIX) => {
            &trimmed[IPV4_MAPPED_PREFIX.len()..]
        }
        _ => trimmed,
    };
    let stripped = stripped.trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Normalize a socket peer address.
pub fn from_ip(ip: IpAddr) -> Option<String> {
    normalize(&ip.to_string())
}

/// Resolve the identity of a request.
///
/// When `trust_forwarded` is set and an `X-Forwarded-For` value is present,
/// its first entry wins over the socket peer.
pub fn resolve(peer: Option<IpAddr>, forwarded_for: Option<&str>, trust_forwarded: bool) -> Option<String> {
    if trust_forwarded {
        if let Some(first) = forwarded_for.and_then(|v| v.split(',').next()) {
            if let Some(id) = normalize(first) {
                return Some(id);
            }
        }
    }
    peer.and_then(from_ip)
}
