//! Builds the counting key for an incoming request: the caller's explicit
//! identifier when the identity layer supplied one, otherwise client IP plus
//! route path.

use actix_web::dev::ServiceRequest;
use std::net::{IpAddr, Ipv6Addr};

/// Namespace prefix on every counting key.
pub const KEY_PREFIX: &str = "rate_limit";

/// Sentinel used when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Derive the counting key for a request.
///
/// With an explicit identifier (e.g. an authenticated user id) the key is
/// `rate_limit:<identifier>`, so one subject shares a window across routes and
/// addresses. Without one it falls back to `rate_limit:<client-ip>:<path>`.
pub fn derive_key(req: &ServiceRequest, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{KEY_PREFIX}:{id}"),
        None => format!("{KEY_PREFIX}:{}:{}", client_ip(req), req.path()),
    }
}

/// Extract the client IP from the forwarded-for header, falling back to the
/// real-ip header and finally to [UNKNOWN_IP]. Never fails; a value that does
/// not parse as an address also degrades to the sentinel.
pub fn client_ip(req: &ServiceRequest) -> String {
    forwarded_candidate(req)
        .and_then(|candidate| ip_key(&candidate))
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn forwarded_candidate(req: &ServiceRequest) -> Option<String> {
    let headers = req.headers();
    if let Some(value) = headers.get(FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        // The first entry is the originating client; later hops append
        let first = value.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_owned());
        }
    }
    headers
        .get(REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
// https://support.cloudflare.com/hc/en-us/articles/115001635128-Configuring-Cloudflare-Rate-Limiting
fn ip_key(ip_str: &str) -> Option<String> {
    let ip = ip_str.parse::<IpAddr>().ok()?;
    Some(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4() {
                return Some(v4.to_string());
            }
            let zeroes = [0u16; 4];
            let concat = [&v6.segments()[0..4], &zeroes].concat();
            let concat: [u16; 8] = concat.try_into().unwrap();
            let subnet = Ipv6Addr::from(concat);
            format!("{}/64", subnet)
        }
    })
}
