// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of the octal escapes `zfs diff` uses in reported paths.
//!
//! The tool escapes every non-printable byte on its own, as a backslash
//! followed by the byte in octal (`\0342`, or in older releases `\342`).
//! A multi-byte UTF-8 character therefore appears as a run of escapes, one
//! per byte, and only makes sense once the whole run has been reassembled.

/// Error returned by [decode_escaped_path].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid escape length: '\\{escape}' has fewer than 3 digits")]
    InvalidEscapeLength { escape: String },

    #[error("invalid octal digits in escape '\\{digits}'")]
    InvalidOctalDigits { digits: String },

    #[error("decoded path is not valid UTF-8: {lossy}")]
    InvalidUtf8 { lossy: String },
}

const MIN_DIGITS: usize = 3;
const MAX_DIGITS: usize = 4;

/// Replaces every octal escape in `raw` with the byte it encodes, and
/// returns the result as text.
///
/// Both the three-digit form (`\NNN`) and the zero-padded four-digit form
/// (`\0NNN`) are accepted. A run of four digits is read as the four-digit
/// form when it starts with `0` and its last three digits fit in a byte.
/// Otherwise the escape ends after three digits and the fourth is ordinary
/// text, so `\0401` is a space followed by `1`.
///
/// A run such as `\0115` fits both readings and is always taken as the
/// four-digit form.
pub fn decode_escaped_path(raw: &str) -> Result<String, DecodeError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }

    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            decoded.push(bytes[i]);
            i += 1;
            continue;
        }

        let start = i + 1;
        let run = bytes[start..]
            .iter()
            .take(MAX_DIGITS)
            .take_while(|b| b.is_ascii_digit())
            .count();
        // Only ASCII digits were counted, so this slice is on char
        // boundaries.
        let digits = &raw[start..start + run];
        if run < MIN_DIGITS {
            return Err(DecodeError::InvalidEscapeLength {
                escape: digits.to_string(),
            });
        }

        let four_digit = if run == MAX_DIGITS && digits.starts_with('0') {
            u8::from_str_radix(&digits[1..], 8).ok()
        } else {
            None
        };
        let (escape, byte) = match four_digit {
            Some(byte) => (digits, byte),
            None => {
                let escape = &digits[..MIN_DIGITS];
                let byte = u8::from_str_radix(escape, 8).map_err(|_| {
                    DecodeError::InvalidOctalDigits {
                        digits: digits.to_string(),
                    }
                })?;
                (escape, byte)
            }
        };

        decoded.push(byte);
        i = start + escape.len();
    }

    String::from_utf8(decoded).map_err(|err| DecodeError::InvalidUtf8 {
        lossy: String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[proptest]
    fn printable_ascii_is_unchanged(
        #[strategy("[ -\\[\\]-~]*")] path: String,
    ) {
        prop_assert_eq!(decode_escaped_path(&path).unwrap(), path);
    }

    #[proptest]
    fn every_byte_escaped(path: String) {
        let raw: String =
            path.bytes().map(|b| format!("\\0{b:03o}")).collect();
        prop_assert_eq!(decode_escaped_path(&raw).unwrap(), path);
    }

    // Mirrors the tool: only bytes outside printable ASCII, and the
    // backslash itself, are escaped.
    #[proptest]
    fn non_printable_bytes_escaped(path: String) {
        let raw: String = path
            .bytes()
            .map(|b| match b {
                b'\\' => "\\0134".to_string(),
                b' '..=b'~' => char::from(b).to_string(),
                _ => format!("\\0{b:03o}"),
            })
            .collect();
        prop_assert_eq!(decode_escaped_path(&raw).unwrap(), path);
    }

    #[test]
    fn printable_ascii_examples() {
        let paths = [
            "",
            "/",
            "/test/origin/file-new",
            "/pool/fs/with spaces/and~tildes_and-dashes.txt",
        ];
        for path in paths {
            assert_eq!(decode_escaped_path(path).unwrap(), path);
        }
    }

    #[test]
    fn multibyte_character_from_escape_run() {
        let raw = "/test/origin/i\\0040\\0342\\0235\\0244\\0040unicode";
        let decoded = decode_escaped_path(raw).unwrap();
        assert_eq!(decoded, "/test/origin/i ❤ unicode");
        assert_eq!(decoded.chars().filter(|c| *c == '❤').count(), 1);
    }

    #[test]
    fn three_digit_escapes() {
        assert_eq!(decode_escaped_path("\\342\\235\\244").unwrap(), "❤");
        // The fourth digit does not belong to the escape.
        assert_eq!(decode_escaped_path("a\\1011").unwrap(), "aA1");
    }

    #[test]
    fn three_digit_escape_before_digit() {
        // `\0401` does not fit in a byte, so it is `\040` followed by `1`.
        assert_eq!(decode_escaped_path("a\\0401").unwrap(), "a 1");
        assert_eq!(decode_escaped_path("\\0777").unwrap(), "?7");
        assert_eq!(decode_escaped_path("a\\0115").unwrap(), "aM");
    }

    #[test]
    fn escaped_backslash() {
        assert_eq!(decode_escaped_path("a\\0134b").unwrap(), "a\\b");
    }

    #[test]
    fn invalid_octal_digits() {
        let err = decode_escaped_path("\\0040\\0999\\0235\\0244\\0040 unicode")
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidOctalDigits { digits: "0999".to_string() }
        );
        assert!(err.to_string().contains("0999"));
    }

    #[test]
    fn escape_larger_than_a_byte() {
        assert_eq!(
            decode_escaped_path("\\777x").unwrap_err(),
            DecodeError::InvalidOctalDigits { digits: "777".to_string() }
        );
        assert_eq!(
            decode_escaped_path("\\0389").unwrap_err(),
            DecodeError::InvalidOctalDigits { digits: "0389".to_string() }
        );
    }

    #[test]
    fn short_escape_at_end() {
        assert_eq!(
            decode_escaped_path("/pool/fs/file\\04").unwrap_err(),
            DecodeError::InvalidEscapeLength { escape: "04".to_string() }
        );
        assert_eq!(
            decode_escaped_path("trailing\\").unwrap_err(),
            DecodeError::InvalidEscapeLength { escape: String::new() }
        );
    }

    #[test]
    fn short_escape_before_text() {
        assert!(matches!(
            decode_escaped_path("\\12x"),
            Err(DecodeError::InvalidEscapeLength { .. })
        ));
    }

    #[test]
    fn truncated_multibyte_run() {
        let err = decode_escaped_path("\\0342\\0235").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { .. }));
    }
}
