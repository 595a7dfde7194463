use std::path::Path;
use tracing::{error, warn};

use crate::error::DeployError;

// For signature verification
use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Helper function for verifying GitHub webhook signature.
/// `payload` must be the raw request body exactly as received.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    // Expected format: "sha256=..."
    let git_signature = match signature_header.strip_prefix("sha256=") {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // GitHub provides the signature as hex
    match hex_decode(git_signature) {
        // verify_slice compares in constant time
        Ok(git_signature_bytes) => mac.verify_slice(&git_signature_bytes).is_ok(),
        Err(_) => {
            error!("Signature header is not valid hex");
            false
        }
    }
}

/// Compute the `sha256=<hex>` signature for a payload.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Authenticate an inbound request.
///
/// With no secret configured the request is rejected unless `allow_unsigned`
/// is set, in which case it is accepted with a warning.
pub fn verify_request(
    secret: Option<&str>,
    allow_unsigned: bool,
    payload: &[u8],
    signature_header: Option<&str>,
) -> Result<(), DeployError> {
    let secret = secret.filter(|s| !s.is_empty());

    let Some(secret) = secret else {
        if allow_unsigned {
            warn!("Accepting webhook WITHOUT signature verification (no secret configured)");
            return Ok(());
        }
        return Err(DeployError::Unauthorized(
            "webhook secret is not configured".to_string(),
        ));
    };

    let Some(signature) = signature_header else {
        return Err(DeployError::Unauthorized(format!(
            "missing {} header",
            SIGNATURE_HEADER
        )));
    };

    if verify_github_signature(secret, payload, signature) {
        Ok(())
    } else {
        Err(DeployError::Unauthorized("invalid signature".to_string()))
    }
}

/// Keep at most `max_chars` characters from the end of `text`,
/// where the most useful part of a failing command's output usually is.
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let skipped: String = trimmed.chars().skip(count - max_chars).collect();
    format!("... (truncated)\n{}", skipped)
}

/// Truncate `text` to `max_chars` characters from the start.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}... (truncated)", head)
}

/// Number of files and total bytes under a directory, recursively.
pub fn dir_stats(dir: &Path) -> std::io::Result<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    if !dir.is_dir() {
        return Ok((0, 0));
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let (f, b) = dir_stats(&entry.path())?;
            files += f;
            bytes += b;
        } else {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((files, bytes))
}
