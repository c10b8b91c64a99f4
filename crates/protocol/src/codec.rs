//! Directive Codec
//!
//! The ledger only sees [`DirectiveCodec`]. [`EnvelopeCodec`] frames a
//! directive as `MAGIC || version || borsh(token, operation)`.

use crate::{error::DecodeError, operation::Operation};
use borsh::{BorshDeserialize, BorshSerialize};

/// A decoded directive bound to its token address
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub token: String,
    pub operation: Operation,
}

/// Decodes data-carrier payloads into directives
pub trait DirectiveCodec: Send + Sync {
    /// `Ok(None)` means the payload is not addressed to this protocol
    fn decode(&self, payload: &[u8]) -> Result<Option<Directive>, DecodeError>;
}

/// Default codec: magic prefix, version byte, borsh body
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub const MAGIC: &'static [u8] = b"ORBIT";
    pub const VERSION: u8 = 0;

    /// Frame a directive for embedding in a data-carrier output
    pub fn encode(&self, directive: &Directive) -> Vec<u8> {
        let body = borsh::to_vec(directive).expect("Directive serialization should not fail");
        let mut out = Vec::with_capacity(Self::MAGIC.len() + 1 + body.len());
        out.extend_from_slice(Self::MAGIC);
        out.push(Self::VERSION);
        out.extend(body);
        out
    }
}

impl DirectiveCodec for EnvelopeCodec {
    fn decode(&self, payload: &[u8]) -> Result<Option<Directive>, DecodeError> {
        let Some(rest) = payload.strip_prefix(Self::MAGIC) else {
            return Ok(None);
        };

        let (&version, body) = rest.split_first().ok_or(DecodeError::MissingVersion)?;
        if version != Self::VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let directive = Directive::try_from_slice(body)
            .map_err(|e| DecodeError::MalformedBody(e.to_string()))?;
        Ok(Some(directive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> Directive {
        Directive {
            token: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string(),
            operation: Operation::Register { units_max: 40 },
        }
    }

    #[test]
    fn test_encode_decode() {
        let codec = EnvelopeCodec;
        let bytes = codec.encode(&register());
        assert!(bytes.starts_with(b"ORBIT"));
        assert_eq!(codec.decode(&bytes).unwrap(), Some(register()));
    }

    #[test]
    fn test_foreign_payload_ignored() {
        assert_eq!(EnvelopeCodec.decode(b"memo.cash post").unwrap(), None);
        assert_eq!(EnvelopeCodec.decode(&[]).unwrap(), None);
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = EnvelopeCodec.encode(&register());
        bytes[5] = 9;
        assert_eq!(
            EnvelopeCodec.decode(&bytes),
            Err(DecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_truncated_body() {
        let bytes = EnvelopeCodec.encode(&register());
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            EnvelopeCodec.decode(cut),
            Err(DecodeError::MalformedBody(_))
        ));
        assert_eq!(
            EnvelopeCodec.decode(b"ORBIT"),
            Err(DecodeError::MissingVersion)
        );
    }
}
