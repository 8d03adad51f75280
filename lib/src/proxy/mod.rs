//! Proxy dispatcher (C6): routes inbound HTTP and raw TCP connections to
//! the endpoint they target, either over a local upstream session or by
//! forwarding once to the cluster node that holds it.

pub mod access_log;
pub mod http;
pub mod tcp;

pub use access_log::AccessLogger;

/// Loop-guard header set on every proxied request/connection the first time
/// it crosses a node boundary; a second hop with this header present is
/// refused (§4.6, single-hop forwarding discipline).
pub const FORWARD_HEADER: &str = "x-piko-forward";
/// Explicit endpoint override, checked before Host-based subdomain
/// extraction.
pub const ENDPOINT_HEADER: &str = "x-piko-endpoint";

/// Extracts the endpoint id a request is targeting from a `Host` header,
/// taking the leftmost subdomain label (`foo.proxy.example.com` -> `foo`).
/// Ported from the teacher's gateway subdomain parser.
pub fn extract_subdomain(host: &str) -> Option<&str> {
    let host = host.rsplit_once(':').map(|(host, _port)| host).unwrap_or(host);
    if host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }
    host.split_once('.').map(|(first, _rest)| first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_leftmost_label() {
        assert_eq!(extract_subdomain("foo.proxy.example.com"), Some("foo"));
        assert_eq!(extract_subdomain("foo.proxy.example.com:443"), Some("foo"));
    }

    #[test]
    fn rejects_bare_ip_hosts() {
        assert_eq!(extract_subdomain("127.0.0.1"), None);
        assert_eq!(extract_subdomain("127.0.0.1:8000"), None);
    }

    #[test]
    fn single_label_host_has_no_subdomain() {
        assert_eq!(extract_subdomain("localhost"), None);
    }
}
