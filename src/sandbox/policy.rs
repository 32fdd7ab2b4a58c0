//! Policy helpers: private address ranges and write-path resolution.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Modules that are always blocked inside a sandbox scope, regardless of
/// configuration. Spawning threads would give tool code a fresh, unenforced
/// sandbox state.
pub const ALWAYS_BLOCKED_MODULES: &[&str] = &["threading", "_thread"];

/// Whether an address falls in a private, loopback, link-local, or
/// unique-local range.
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Resolve a path for prefix comparison. Falls back to resolving the parent
/// when the target does not exist yet (the common case for writes).
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent_resolved) = parent.canonicalize() {
            return parent_resolved.join(name);
        }
    }
    path.to_path_buf()
}

/// Whether `target` may be written given the allowlist. An empty allowlist
/// denies all writes.
pub fn write_allowed(target: &Path, allowed_write_paths: &[String]) -> bool {
    if allowed_write_paths.is_empty() {
        return false;
    }
    let resolved = resolve_path(target);
    allowed_write_paths.iter().any(|allowed| {
        let allowed = resolve_path(Path::new(allowed));
        resolved == allowed || resolved.starts_with(&allowed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_v4_ranges() {
        for addr in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "127.0.0.1", "169.254.0.5"] {
            assert!(is_private_ip(addr.parse().unwrap()), "{addr} should be private");
        }
        for addr in ["8.8.8.8", "1.1.1.1", "172.32.0.1"] {
            assert!(!is_private_ip(addr.parse().unwrap()), "{addr} should be public");
        }
    }

    #[test]
    fn test_private_v6_ranges() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("fd12:3456::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("2607:f8b0::1".parse().unwrap()));
    }

    #[test]
    fn test_empty_allowlist_denies() {
        assert!(!write_allowed(Path::new("/tmp/x"), &[]));
    }

    #[test]
    fn test_prefix_match() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = vec![dir.path().to_string_lossy().to_string()];
        assert!(write_allowed(&dir.path().join("new-file.txt"), &allowed));
        assert!(write_allowed(&dir.path().join("sub/nested.txt"), &allowed));
        assert!(!write_allowed(Path::new("/etc/passwd"), &allowed));
    }

    #[test]
    fn test_resolve_nonexistent_uses_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not-yet-created.txt");
        let resolved = resolve_path(&target);
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }
}
