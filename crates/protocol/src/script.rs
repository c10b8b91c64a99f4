//! Script push parsing
//!
//! Only the push opcodes are understood. Data-carrier outputs are
//! `OP_RETURN <push>` and unlocking scripts are `<push sig> <push pubkey>`.

use crate::error::DecodeError;

pub const OP_RETURN: u8 = 0x6a;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;

/// Decode a hex script as reported by the chain source
pub fn decode_hex(script_hex: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(script_hex).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

fn take(script: &[u8], pos: &mut usize, len: usize) -> Result<usize, DecodeError> {
    let remaining = script.len().saturating_sub(*pos);
    if len > remaining {
        return Err(DecodeError::TruncatedPush {
            needed: len,
            remaining,
        });
    }
    let start = *pos;
    *pos += len;
    Ok(start)
}

fn read_len(script: &[u8], pos: &mut usize, width: usize) -> Result<usize, DecodeError> {
    let start = take(script, pos, width)?;
    let mut bytes = [0u8; 4];
    bytes[..width].copy_from_slice(&script[start..start + width]);
    Ok(u32::from_le_bytes(bytes) as usize)
}

/// Read a single push starting at `pos`, advancing it past the pushed data
pub fn read_push<'a>(script: &'a [u8], pos: &mut usize) -> Result<&'a [u8], DecodeError> {
    let opcode = script[take(script, pos, 1)?];

    let len = match opcode {
        0x00 => 0,
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => read_len(script, pos, 1)?,
        OP_PUSHDATA2 => read_len(script, pos, 2)?,
        OP_PUSHDATA4 => read_len(script, pos, 4)?,
        other => return Err(DecodeError::NotAPush(other)),
    };

    let start = take(script, pos, len)?;
    Ok(&script[start..start + len])
}

/// Split a push-only script into its pushed items
pub fn pushes(script: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut pos = 0;
    let mut items = Vec::new();
    while pos < script.len() {
        items.push(read_push(script, &mut pos)?);
    }
    Ok(items)
}

/// Payload of a data-carrier output, or `None` if the script is not one
pub fn data_carrier_payload(script: &[u8]) -> Option<Result<&[u8], DecodeError>> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }

    if script.len() == 1 {
        return Some(Ok(&[]));
    }

    let mut pos = 1;
    Some(read_push(script, &mut pos))
}

/// Wrap `data` in the smallest push opcode that fits
pub fn push(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        len @ 0..=0x4b => out.push(len as u8),
        len @ 0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// Build an `OP_RETURN <payload>` locking script
pub fn data_carrier_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    script.extend(push(payload));
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_push() {
        let script = [0x02, 0xaa, 0xbb, 0x01, 0xcc];
        let items = pushes(&script).unwrap();
        assert_eq!(items, vec![&[0xaa, 0xbb][..], &[0xcc][..]]);
    }

    #[test]
    fn test_pushdata_widths() {
        let big = vec![7u8; 300];
        let script = push(&big);
        assert_eq!(script[0], OP_PUSHDATA2);
        assert_eq!(pushes(&script).unwrap(), vec![&big[..]]);

        let medium = vec![1u8; 100];
        let script = push(&medium);
        assert_eq!(script[0], OP_PUSHDATA1);
        assert_eq!(pushes(&script).unwrap(), vec![&medium[..]]);
    }

    #[test]
    fn test_truncated_push() {
        let script = [0x05, 0x01, 0x02];
        assert_eq!(
            pushes(&script),
            Err(DecodeError::TruncatedPush {
                needed: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_non_push_opcode() {
        assert_eq!(pushes(&[0x76]), Err(DecodeError::NotAPush(0x76)));
    }

    #[test]
    fn test_data_carrier_payload() {
        let script = data_carrier_script(b"hello");
        assert_eq!(data_carrier_payload(&script), Some(Ok(&b"hello"[..])));

        // P2PKH locking script is not a data carrier
        let p2pkh = decode_hex("76a91489abcdefabbaabbaabbaabbaabbaabbaabbaabba88ac").unwrap();
        assert_eq!(data_carrier_payload(&p2pkh), None);

        assert_eq!(data_carrier_payload(&[OP_RETURN]), Some(Ok(&[][..])));
    }
}
