//! Host-header resolution
//!
//! Extracts the routing name from the `Host` header of a public request.
//! The subdomain prefix is everything left of the registrable domain, so
//! `my.super.example.com` resolves to `my.super`. When the relay itself
//! runs under a base subdomain (say `tunnel`), that trailing label is
//! stripped: `alice.tunnel.example.com` resolves to `alice`, while
//! `tunnel.example.com` has no routable name at all.

use thiserror::Error;
use tracing::trace;

/// Resolution errors, surfaced to public callers as a 502 body
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("missing or empty Host header")]
    InvalidHostname,

    #[error("hostname carries no routable subdomain")]
    InvalidSubdomain,
}

/// Resolve the routing name from a raw `Host` header value.
///
/// `base_subdomain` is the label the relay itself runs under; empty means
/// none. The returned name is lowercase; dots survive for nested labels
/// (`my.super`), which simply never match a registered single-label name.
pub fn resolve_name(host: Option<&str>, base_subdomain: &str) -> Result<String, ResolveError> {
    let host = match host {
        Some(h) if !h.trim().is_empty() => h.trim(),
        _ => return Err(ResolveError::InvalidHostname),
    };

    // Strip an optional port, then a trailing root-zone dot
    let host = host.split(':').next().unwrap_or(host);
    let host = host.strip_suffix('.').unwrap_or(host);
    let host = host.to_ascii_lowercase();

    let prefix = subdomain_prefix(&host).ok_or(ResolveError::InvalidSubdomain)?;

    let name = if base_subdomain.is_empty() {
        prefix.to_string()
    } else {
        let base = base_subdomain.to_ascii_lowercase();
        if prefix == base {
            return Err(ResolveError::InvalidSubdomain);
        }
        match prefix.strip_suffix(&format!(".{base}")) {
            Some(stripped) if stripped.is_empty() => return Err(ResolveError::InvalidSubdomain),
            Some(stripped) => stripped.to_string(),
            None => prefix.to_string(),
        }
    };

    trace!("resolved host {} to name {}", host, name);
    Ok(name)
}

/// Everything left of the registrable domain (the last two labels).
///
/// Returns `None` when the hostname has no subdomain to route on.
fn subdomain_prefix(host: &str) -> Option<&str> {
    let labels = host.split('.').count();
    if labels < 3 {
        return None;
    }

    // Walk back over the two registrable labels
    let cut = host.rfind('.')?;
    let cut = host[..cut].rfind('.')?;
    if cut == 0 {
        return None;
    }

    Some(&host[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_label_subdomain() {
        assert_eq!(resolve_name(Some("alice.example.com"), "").unwrap(), "alice");
    }

    #[test]
    fn test_nested_labels_survive() {
        assert_eq!(
            resolve_name(Some("my.super.example.com"), "").unwrap(),
            "my.super"
        );
    }

    #[test]
    fn test_missing_host_header() {
        assert_eq!(resolve_name(None, ""), Err(ResolveError::InvalidHostname));
        assert_eq!(resolve_name(Some(""), ""), Err(ResolveError::InvalidHostname));
        assert_eq!(
            resolve_name(Some("   "), ""),
            Err(ResolveError::InvalidHostname)
        );
    }

    #[test]
    fn test_registered_domain_only() {
        assert_eq!(
            resolve_name(Some("example.com"), ""),
            Err(ResolveError::InvalidSubdomain)
        );
        assert_eq!(
            resolve_name(Some("localhost"), ""),
            Err(ResolveError::InvalidSubdomain)
        );
    }

    #[test]
    fn test_port_is_stripped() {
        assert_eq!(
            resolve_name(Some("alice.example.com:8080"), "").unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_name_is_lowercased() {
        assert_eq!(resolve_name(Some("ALICE.Example.COM"), "").unwrap(), "alice");
    }

    #[test]
    fn test_base_subdomain_is_stripped() {
        assert_eq!(
            resolve_name(Some("alice.tunnel.example.com"), "tunnel").unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_base_subdomain_alone_is_not_routable() {
        assert_eq!(
            resolve_name(Some("tunnel.example.com"), "tunnel"),
            Err(ResolveError::InvalidSubdomain)
        );
    }

    #[test]
    fn test_unrelated_prefix_keeps_base_untouched() {
        assert_eq!(
            resolve_name(Some("alice.example.com"), "tunnel").unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_nested_prefix_under_base() {
        assert_eq!(
            resolve_name(Some("my.super.tunnel.example.com"), "tunnel").unwrap(),
            "my.super"
        );
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        assert_eq!(
            resolve_name(Some("alice.example.com."), "").unwrap(),
            "alice"
        );
    }
}
