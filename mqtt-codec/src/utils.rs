// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{DecodeError, EncodeError};

/// Generate a random alphanumeric string, used by callers that need to
/// mint a server-assigned `client_id` (MQTT-3.1.3-6).
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Check that a length-prefixed field's length fits in the 16-bit wire
/// encoding used for every MQTT string/binary field.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        Err(EncodeError::PayloadTooLong)
    } else {
        Ok(())
    }
}

/// Validate a string per the MQTT UTF-8 string contract: no embedded NUL
/// and no C0/C1 control characters.
pub fn validate_utf8_string(s: &str) -> Result<(), DecodeError> {
    if s.len() > u16::MAX as usize {
        return Err(DecodeError::InvalidUtf8String);
    }
    for c in s.chars() {
        if c == '\u{0000}' {
            return Err(DecodeError::InvalidUtf8String);
        }
        if ('\u{0001}'..='\u{001f}').contains(&c) || ('\u{007f}'..='\u{009f}').contains(&c) {
            return Err(DecodeError::InvalidUtf8String);
        }
    }
    Ok(())
}

/// Convert raw bytes to a validated UTF-8 string.
pub fn to_utf8_string(buf: &[u8]) -> Result<String, DecodeError> {
    let s = String::from_utf8(buf.to_vec())?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// `client_id` must be at most 23 bytes of `[0-9a-zA-Z]` per MQTT 3.1.1
/// §3.1.3.5, though in practice most brokers (this one included) relax the
/// length/charset restriction and only reject the empty-with-clean-session-
/// false combination, which is checked by the caller.
pub fn validate_client_id(client_id: &str) -> Result<(), DecodeError> {
    validate_utf8_string(client_id)?;
    if client_id.len() > u16::MAX as usize {
        return Err(DecodeError::InvalidClientId);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nul() {
        assert!(validate_utf8_string("a\u{0000}b").is_err());
    }

    #[test]
    fn accepts_plain_ascii() {
        assert!(validate_utf8_string("hello").is_ok());
    }

    #[test]
    fn random_string_has_requested_length() {
        assert_eq!(random_string(16).len(), 16);
    }
}
