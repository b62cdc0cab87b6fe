use std::io::{Error, ErrorKind, Result};

/// A utility type representing a SHA-256 digest in binary.
pub type Sha256Digest = [u8; 32];

/// Parse a string containing a SHA256 digest in hexidecimal form into a Sha256Digest.
///
/// The string must contain exactly 64 characters and consist entirely of [0-9a-f], case
/// insensitive.
///
/// In case of a failure to parse the string, this function returns ErrorKind::InvalidInput.
pub fn parse_sha256(string: impl AsRef<str>) -> Result<Sha256Digest> {
    let mut value = [0u8; 32];
    hex::decode_to_slice(string.as_ref(), &mut value)
        .map_err(|source| Error::new(ErrorKind::InvalidInput, source))?;
    Ok(value)
}

/// Checks that `digest` looks like a content digest of the form `algorithm:encoded`.
///
/// The algorithm component is made of lowercase alphanumerics and the separators `+._-`, and the
/// encoded part must be non-empty hex.  For `sha256` the encoded part is additionally required to
/// be exactly 64 characters, via [`parse_sha256`].
///
/// Returns the algorithm and the encoded part on success.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let invalid = |msg: &str| Error::new(ErrorKind::InvalidInput, format!("{msg}: {digest:?}"));

    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return Err(invalid("digest is missing an algorithm"));
    };
    if algorithm.is_empty()
        || !algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b))
    {
        return Err(invalid("invalid digest algorithm"));
    }
    if encoded.is_empty() || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid("invalid digest encoding"));
    }
    if algorithm == "sha256" {
        parse_sha256(encoded)?;
    }
    Ok((algorithm, encoded))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_sha256() {
        let valid = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let valid_caps = "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFf";
        assert_eq!(hex::encode(parse_sha256(valid).unwrap()), valid);
        assert_eq!(hex::encode(parse_sha256(valid_caps).unwrap()), valid);

        fn assert_invalid(x: &str) {
            assert_eq!(parse_sha256(x).unwrap_err().kind(), ErrorKind::InvalidInput);
        }

        assert_invalid("");
        assert_invalid("/etc/shadow");
        // too short
        assert_invalid("00112233445566778899aabbccddeeff00112233445566778899aabbccddeef");
        // non-hex character
        assert_invalid("00112233445566778899aabbccddeeff00112233445566778899aabbccddeefg");
    }

    #[test]
    fn test_split_digest() {
        let sha = format!("sha256:{}", "ab".repeat(32));
        assert_eq!(split_digest(&sha).unwrap(), ("sha256", "ab".repeat(32).as_str()));
        assert_eq!(split_digest("sha512:abcdef").unwrap(), ("sha512", "abcdef"));

        for bad in ["", "sha256", "sha256:", ":abcd", "SHA256:abcd", "sha256:abcd", "md5:xyz"] {
            assert_eq!(
                split_digest(bad).unwrap_err().kind(),
                ErrorKind::InvalidInput,
                "{bad:?} should be rejected"
            );
        }
    }
}
