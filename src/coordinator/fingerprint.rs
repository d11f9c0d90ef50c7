//! Content fingerprints for drift detection.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the content.
pub fn content_fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Whether content changed since the prior fingerprint. No prior means no drift.
pub fn has_drifted(prior: Option<&str>, current: &str) -> bool {
    prior.is_some_and(|p| !p.eq_ignore_ascii_case(current))
}
