//! Host identity verification policies for remote sessions.
//!
//! Ephemeral GPU instances present a fresh host key on every launch, so the
//! default policy is trust-on-first-use: an unknown host is recorded in the
//! known-hosts store and any later mismatch for the same address is rejected.

use std::net::IpAddr;

use camino::Utf8PathBuf;

/// How the server's host key is verified after the SSH handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostKeyPolicy {
    /// Accept and record unknown hosts; reject keys that changed.
    AcceptNew {
        /// OpenSSH-format known-hosts file.
        known_hosts: Utf8PathBuf,
    },
    /// Accept only hosts already present in the known-hosts file.
    Strict {
        /// OpenSSH-format known-hosts file.
        known_hosts: Utf8PathBuf,
    },
    /// Accept any host key without checking.
    Insecure,
    /// Accept only a host key whose SHA-256 digest matches this hex string.
    Fingerprint(String),
}

impl HostKeyPolicy {
    /// Known-hosts file consulted by this policy, if any.
    #[must_use]
    pub const fn known_hosts_file(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::AcceptNew { known_hosts } | Self::Strict { known_hosts } => Some(known_hosts),
            Self::Insecure | Self::Fingerprint(_) => None,
        }
    }
}

/// Result of looking a host up in the known-hosts store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum KnownHostStatus {
    Match,
    NotFound,
    Mismatch,
}

/// What to do with a host after the known-hosts lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HostKeyDecision {
    Trusted,
    Record,
}

/// Applies a known-hosts policy to a lookup result.
pub(crate) fn known_hosts_decision(
    accept_new: bool,
    status: KnownHostStatus,
    host: &str,
) -> Result<HostKeyDecision, String> {
    match status {
        KnownHostStatus::Match => Ok(HostKeyDecision::Trusted),
        KnownHostStatus::NotFound if accept_new => Ok(HostKeyDecision::Record),
        KnownHostStatus::NotFound => Err(format!(
            "host {host} is not in the known-hosts file and strict checking is enabled"
        )),
        KnownHostStatus::Mismatch => Err(format!(
            "host key for {host} does not match the known-hosts entry"
        )),
    }
}

/// Formats the host part of a known-hosts line, bracketing non-default ports.
pub(crate) fn known_hosts_entry(address: IpAddr, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{address}]:{port}")
    }
}

/// Lowercases a hex fingerprint and strips `SHA256:` prefixes, colons, and
/// whitespace.
pub(crate) fn normalise_fingerprint(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("SHA256:")
        .or_else(|| trimmed.strip_prefix("sha256:"))
        .unwrap_or(trimmed);
    body.chars()
        .filter(|ch| *ch != ':' && !ch.is_whitespace())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Compares a pinned fingerprint with the digest the server presented.
pub(crate) fn check_fingerprint(expected: &str, actual_digest: &[u8]) -> Result<(), String> {
    let expected_hex = normalise_fingerprint(expected);
    let actual_hex = hex_digest(actual_digest);
    if expected_hex == actual_hex {
        Ok(())
    } else {
        Err(format!(
            "host key fingerprint {actual_hex} does not match the pinned {expected_hex}"
        ))
    }
}
