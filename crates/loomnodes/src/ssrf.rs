//! Outbound URL guard.
//!
//! Every HTTP hop the engine makes goes through [`check_url`] first:
//! the initial request and each redirect target. Literal IPs are checked
//! directly; hostnames are resolved and every returned address must be
//! acceptable. Allowlisted hosts skip the address checks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use loomcore::{EnginePolicy, SecurityError};

/// Validate an outbound URL against policy. Returns the parsed URL so
/// the caller issues the request against exactly what was checked.
pub async fn check_url(raw: &str, policy: &EnginePolicy) -> Result<Url, SecurityError> {
    let url = Url::parse(raw).map_err(|e| SecurityError::InvalidUrl(format!("{raw}: {e}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(SecurityError::SchemeNotAllowed {
            scheme: scheme.to_string(),
        });
    }

    let host = match url.host() {
        Some(h) => h,
        None => return Err(SecurityError::InvalidUrl(format!("{raw}: missing host"))),
    };

    match host {
        Host::Ipv4(ip) => check_addr(IpAddr::V4(ip), &ip.to_string(), policy)?,
        Host::Ipv6(ip) => check_addr(IpAddr::V6(ip), &ip.to_string(), policy)?,
        Host::Domain(name) => {
            let name = normalize_host(name);
            if !host_allowlisted(&name, &policy.http_allowlist) && !policy.allow_private_network {
                let port = url.port_or_known_default().unwrap_or(80);
                let addrs: Vec<IpAddr> = tokio::net::lookup_host((name.as_str(), port))
                    .await
                    .map_err(|_| SecurityError::UnresolvableHost { host: name.clone() })?
                    .map(|sa| sa.ip())
                    .collect();
                if addrs.is_empty() {
                    return Err(SecurityError::UnresolvableHost { host: name });
                }
                for addr in addrs {
                    if is_blocked(addr) {
                        return Err(SecurityError::PrivateHostBlocked { host: name });
                    }
                }
            }
        }
    }

    Ok(url)
}

fn check_addr(addr: IpAddr, host: &str, policy: &EnginePolicy) -> Result<(), SecurityError> {
    if host_allowlisted(host, &policy.http_allowlist) || policy.allow_private_network {
        return Ok(());
    }
    if is_blocked(addr) {
        return Err(SecurityError::PrivateHostBlocked {
            host: host.to_string(),
        });
    }
    Ok(())
}

/// Lowercase and strip a trailing dot, the two normalizations DNS
/// treats as identity.
fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Exact entry matches the host; a `*.domain` entry matches any
/// subdomain of `domain` and `domain` itself. Entries may be pasted as
/// full URLs; they are reduced to their hostname first.
fn host_allowlisted(host: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|entry| {
        let entry = entry_hostname(entry);
        if let Some(suffix) = entry.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == entry
        }
    })
}

fn entry_hostname(entry: &str) -> String {
    let entry = entry.trim();
    if entry.contains("://") {
        if let Ok(u) = Url::parse(entry) {
            if let Some(h) = u.host_str() {
                return normalize_host(h.trim_start_matches('[').trim_end_matches(']'));
            }
        }
    }
    // strip any path and port the operator left on the entry
    let bare = entry.split('/').next().unwrap_or(entry);
    normalize_host(strip_port(bare))
}

fn strip_port(host: &str) -> &str {
    if let Some(inner) = host.strip_prefix('[') {
        // bracketed IPv6 literal, with or without a trailing port
        return inner.split(']').next().unwrap_or(inner);
    }
    match host.rfind(':') {
        // two colons mean an unbracketed IPv6 literal, not a port
        Some(idx) if host[..idx].contains(':') => host,
        Some(idx) => &host[..idx],
        None => host,
    }
}

fn is_blocked(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => is_blocked_v4(ip),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_blocked_v4(mapped);
            }
            is_blocked_v6(ip)
        }
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 0.0.0.0/8
        || octets[0] == 0
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // ULA fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_policy() -> EnginePolicy {
        EnginePolicy::default()
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let err = check_url("ftp://example.com/file", &open_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::SchemeNotAllowed { .. }));

        let err = check_url("file:///etc/passwd", &open_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::SchemeNotAllowed { .. }));
    }

    #[tokio::test]
    async fn blocks_loopback_and_private_literals() {
        for raw in [
            "http://127.0.0.1/admin",
            "http://10.0.0.8/",
            "http://192.168.1.1/",
            "http://172.16.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://100.64.0.1/",
            "http://[::1]/",
            "http://[fc00::1]/",
            "http://[::ffff:127.0.0.1]/",
        ] {
            let err = check_url(raw, &open_policy()).await.unwrap_err();
            assert!(
                matches!(err, SecurityError::PrivateHostBlocked { .. }),
                "{raw} should be blocked, got {err}"
            );
        }
    }

    #[tokio::test]
    async fn allows_public_literal() {
        assert!(check_url("https://93.184.216.34/", &open_policy())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn private_override_admits_loopback() {
        let mut policy = open_policy();
        policy.allow_private_network = true;
        assert!(check_url("http://127.0.0.1:8080/hook", &policy).await.is_ok());
    }

    #[tokio::test]
    async fn allowlist_exempts_exact_host() {
        let policy = EnginePolicy::default().with_allowlist(vec!["127.0.0.1".to_string()]);
        assert!(check_url("http://127.0.0.1/ok", &policy).await.is_ok());
    }

    #[test]
    fn glob_entry_matches_subdomains_and_apex() {
        let list = vec!["*.example.com".to_string()];
        assert!(host_allowlisted("api.example.com", &list));
        assert!(host_allowlisted("deep.api.example.com", &list));
        assert!(host_allowlisted("example.com", &list));
        assert!(!host_allowlisted("notexample.com", &list));
    }

    #[tokio::test]
    async fn allowlist_entry_with_port_still_matches_its_host() {
        let policy = EnginePolicy::default().with_allowlist(vec!["127.0.0.1:8080".to_string()]);
        assert!(check_url("http://127.0.0.1:8080/hook", &policy).await.is_ok());
        assert!(check_url("http://127.0.0.1/hook", &policy).await.is_ok());
    }

    #[test]
    fn entries_reduce_to_bare_hostnames() {
        assert_eq!(entry_hostname("https://API.Example.com/v1"), "api.example.com");
        assert_eq!(entry_hostname("host.test."), "host.test");
        assert_eq!(entry_hostname("host.test/path"), "host.test");
        assert_eq!(entry_hostname("host.test:8080"), "host.test");
        assert_eq!(entry_hostname("host.test:8080/path"), "host.test");
        assert_eq!(entry_hostname("[::1]:8080"), "::1");
        assert_eq!(entry_hostname("fc00::1"), "fc00::1");
        assert_eq!(entry_hostname("https://[::1]:8080/"), "::1");
    }

    #[test]
    fn hostname_normalization() {
        assert_eq!(normalize_host("Example.COM."), "example.com");
    }
}
