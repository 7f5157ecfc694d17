use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::instrument;

use crate::error::CodecError;

/// Stacks differ on padding and trailing bits, so decoding accepts both.
const TOLERANT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A payload as it crosses the radio boundary.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RadioValue {
    /// Platform-encoded (base64) string.
    Encoded(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// No value was delivered.
    Empty,
}

impl RadioValue {
    /// Encodes outgoing bytes the way the platform expects them.
    #[must_use]
    pub fn encode(bytes: &[u8]) -> Self {
        Self::Encoded(STANDARD.encode(bytes))
    }

    /// Decodes an incoming value into bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when an encoded string is not valid base64.
    #[instrument(level = "trace")]
    pub fn decode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Empty => Ok(Vec::new()),
            Self::Encoded(encoded) => {
                let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                if cleaned.is_empty() {
                    return Ok(Vec::new());
                }
                TOLERANT
                    .decode(cleaned.as_bytes())
                    .map_err(|_error| CodecError::InvalidEncoding {
                        value: encoded.clone(),
                    })
            }
        }
    }
}

impl From<Vec<u8>> for RadioValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn encoded_write_decodes_back_to_original_bytes() {
        let bytes = vec![0x01, 0x00, 0xFF, 0x7F, 0x80];
        let encoded = RadioValue::encode(&bytes);

        assert_eq!(RadioValue::Encoded("AQD/f4A=".to_string()), encoded);
        assert_eq!(bytes, encoded.decode().expect("encoded value should decode"));
    }

    #[rstest]
    #[case::missing_padding("AQD/f4A", vec![0x01, 0x00, 0xFF, 0x7F, 0x80])]
    #[case::embedded_newline("AQD/\nf4A=", vec![0x01, 0x00, 0xFF, 0x7F, 0x80])]
    #[case::empty_string("", vec![])]
    fn decode_tolerates_platform_quirks(#[case] encoded: &str, #[case] expected: Vec<u8>) {
        let decoded = RadioValue::Encoded(encoded.to_string())
            .decode()
            .expect("quirky value should still decode");
        assert_eq!(expected, decoded);
    }

    #[test]
    fn raw_and_empty_values_pass_through() {
        assert_eq!(
            vec![1, 2, 3],
            RadioValue::Bytes(vec![1, 2, 3]).decode().expect("bytes decode")
        );
        assert_eq!(
            Vec::<u8>::new(),
            RadioValue::Empty.decode().expect("empty decode")
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        let decoded = RadioValue::Encoded("not base64!".to_string()).decode();
        assert_matches!(decoded, Err(CodecError::InvalidEncoding { .. }));
    }
}
