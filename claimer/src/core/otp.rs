//! Time-based one-time passwords (RFC 6238, HMAC-SHA1) and code validation.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Seconds per TOTP step.
pub const TOTP_STEP_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtpError {
    #[error("otp seed is not valid base32")]
    InvalidSeed,
    #[error("otp length {0} is outside 4..=8")]
    InvalidLength(usize),
}

/// Decode a base32 seed as shown by authenticator setup pages.
///
/// Whitespace, dashes and padding are ignored; case does not matter.
pub fn decode_seed(seed: &str) -> Result<Vec<u8>, OtpError> {
    let normalized: String = seed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(OtpError::InvalidSeed);
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| OtpError::InvalidSeed)
}

/// HOTP value (RFC 4226) for `counter`, zero-padded to `digits`.
pub fn hotp(key: &[u8], counter: u64, digits: usize) -> Result<String, OtpError> {
    if !(4..=8).contains(&digits) {
        return Err(OtpError::InvalidLength(digits));
    }
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| OtpError::InvalidSeed)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let modulus = 10u32.pow(digits as u32);
    Ok(format!("{:0width$}", binary % modulus, width = digits))
}

/// TOTP code for the given unix time.
pub fn totp(seed: &str, unix_secs: u64, digits: usize) -> Result<String, OtpError> {
    let key = decode_seed(seed)?;
    hotp(&key, unix_secs / TOTP_STEP_SECS, digits)
}

/// True if `code` is exactly `expected_len` ASCII digits.
pub fn is_valid_code(code: &str, expected_len: usize) -> bool {
    code.len() == expected_len && code.bytes().all(|b| b.is_ascii_digit())
}
