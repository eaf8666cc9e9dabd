//! Shared utility functions for the CLI and the library.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Gets the cross-platform database path.
///
/// Returns the path as `{data_dir}/scalpel/scalpel.db` where `data_dir` is:
/// - Linux: `~/.local/share`
/// - macOS: `~/Library/Application Support`
/// - Windows: `C:\Users\<user>\AppData\Roaming`
///
/// # Errors
///
/// Returns an error if the data directory cannot be determined.
pub fn get_database_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;

    Ok(data_dir.join("scalpel").join("scalpel.db"))
}

/// Ensures the parent directory of the database file exists.
///
/// # Errors
///
/// Returns an error if directory creation fails.
pub fn ensure_database_directory(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    Ok(())
}

/// Picks the client address recorded with an anonymous comment.
///
/// The first `X-Forwarded-For` entry wins over the socket address.
/// IPv4-mapped IPv6 addresses are unwrapped and the IPv6 loopback is
/// reported as `127.0.0.1`.
pub fn normalize_client_ip(forwarded_for: Option<&str>, remote_addr: Option<&str>) -> Option<String> {
    let raw = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .or_else(|| remote_addr.map(str::trim).filter(|addr| !addr.is_empty()))?;

    let normalized = match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) if v6.is_loopback() => "127.0.0.1".to_string(),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => raw.strip_prefix("::ffff:").unwrap_or(raw).to_string(),
    };
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_ends_with_scalpel_db() {
        let path = get_database_path().unwrap();
        assert!(path.ends_with("scalpel/scalpel.db"));
    }

    #[test]
    fn ensure_database_directory_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("a").join("b").join("scalpel.db");

        ensure_database_directory(&db_path).unwrap();

        assert!(db_path.parent().unwrap().is_dir());
    }

    #[test]
    fn forwarded_for_takes_first_entry() {
        assert_eq!(
            normalize_client_ip(Some(" 203.0.113.7 , 10.0.0.1"), Some("10.0.0.2")),
            Some("203.0.113.7".to_string())
        );
    }

    #[test]
    fn falls_back_to_remote_address() {
        assert_eq!(
            normalize_client_ip(None, Some("198.51.100.4")),
            Some("198.51.100.4".to_string())
        );
        assert_eq!(
            normalize_client_ip(Some("  "), Some("198.51.100.4")),
            Some("198.51.100.4".to_string())
        );
        assert_eq!(normalize_client_ip(None, None), None);
    }

    #[test]
    fn unwraps_mapped_and_loopback_addresses() {
        assert_eq!(
            normalize_client_ip(None, Some("::ffff:192.0.2.1")),
            Some("192.0.2.1".to_string())
        );
        assert_eq!(normalize_client_ip(None, Some("::1")), Some("127.0.0.1".to_string()));
        assert_eq!(
            normalize_client_ip(None, Some("2001:db8::1")),
            Some("2001:db8::1".to_string())
        );
    }

    #[test]
    fn unparseable_values_are_kept() {
        assert_eq!(
            normalize_client_ip(Some("unknown"), None),
            Some("unknown".to_string())
        );
    }
}
