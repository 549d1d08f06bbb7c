//! Command codec
//!
//! Pure transformations between `(CommandSpec, args)` and wire bytes, and
//! between readback bytes and a [`CommandResponse`]. No transport state
//! lives here.
//!
//! ASCII requests are `"<NAME> <arg> ...\n"`. Binary requests are a 4-byte
//! header (two reserved zero bytes + big-endian command id) followed by the
//! big-endian packed arguments, with the whole buffer passed through COBS
//! so no zero byte appears on the wire. Binary replies are the packed
//! return values followed by a single response-code byte and are not
//! stuffed.

use byteorder::{BigEndian, ByteOrder};

use crate::catalog::{CommandSpec, ResponseCode};
use crate::layout::Value;

use super::error::ProtocolError;

/// Result of one command/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// ASCII-mode reply: everything received up to the terminator, with the
    /// terminator and trailing newline stripped.
    Ascii { text: String },
    /// Binary-mode reply: raw response-code byte plus decoded return values.
    Binary { code: u8, ret: Vec<Value> },
}

impl CommandResponse {
    /// Decoded response code, when this is a binary reply with a byte in
    /// the known range. `None` for ASCII replies and for out-of-range
    /// bytes left behind by verbose-mode preambles.
    pub fn code(&self) -> Option<ResponseCode> {
        match self {
            CommandResponse::Binary { code, .. } => ResponseCode::from_byte(*code),
            CommandResponse::Ascii { .. } => None,
        }
    }

    /// True for an ASCII reply, or a binary reply with code OK.
    pub fn is_ok(&self) -> bool {
        match self {
            CommandResponse::Ascii { .. } => true,
            CommandResponse::Binary { .. } => self.code() == Some(ResponseCode::Ok),
        }
    }

    /// Return values of a binary reply.
    pub fn ret(&self) -> &[Value] {
        match self {
            CommandResponse::Binary { ret, .. } => ret,
            CommandResponse::Ascii { .. } => &[],
        }
    }

    /// Text of an ASCII reply.
    pub fn text(&self) -> &str {
        match self {
            CommandResponse::Ascii { text } => text,
            CommandResponse::Binary { .. } => "",
        }
    }
}

/// Format an ASCII-mode request: upper-cased name, space-separated
/// stringified arguments, LF terminator.
///
/// No escaping is performed; argument values containing whitespace are not
/// representable in this mode.
pub fn encode_ascii(spec: &CommandSpec, args: &[Value]) -> Vec<u8> {
    let mut line = spec.name.to_uppercase();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string());
    }
    line.push('\n');
    line.into_bytes()
}

/// Encode a binary-mode request, COBS-stuffed.
pub fn encode_binary(spec: &CommandSpec, args: &[Value]) -> Result<Vec<u8>, ProtocolError> {
    let packed = spec.args.pack(args)?;

    let mut raw = Vec::with_capacity(4 + packed.len());
    raw.extend_from_slice(&[0, 0]);
    let mut id = [0u8; 2];
    BigEndian::write_u16(&mut id, spec.id);
    raw.extend_from_slice(&id);
    raw.extend_from_slice(&packed);

    Ok(cobs::encode_vec(&raw))
}

/// Undo the COBS stuffing of an encoded request and split it into the
/// command id and the packed argument bytes.
pub fn decode_binary(stuffed: &[u8]) -> Result<(u16, Vec<u8>), ProtocolError> {
    let raw = cobs::decode_vec(stuffed).map_err(|_| ProtocolError::Stuffing)?;
    if raw.len() < 4 {
        return Err(ProtocolError::ShortReadback {
            expected: 4,
            got: raw.len(),
        });
    }
    let id = BigEndian::read_u16(&raw[2..4]);
    Ok((id, raw[4..].to_vec()))
}

/// Decode a binary readback.
///
/// The last byte is always the response code; the `ret` layout's bytes sit
/// immediately before it. A response-code byte outside the known
/// enumeration is tolerated (it happens whenever verbose diagnostics
/// misalign the readback) and surfaces as `code() == None`.
pub fn decode_readback(spec: &CommandSpec, raw: &[u8]) -> Result<CommandResponse, ProtocolError> {
    let ret_size = spec.ret.packed_size();
    if raw.len() < ret_size + 1 {
        return Err(ProtocolError::ShortReadback {
            expected: ret_size + 1,
            got: raw.len(),
        });
    }

    let code = raw[raw.len() - 1];
    let ret = spec.ret.unpack(&raw[raw.len() - 1 - ret_size..raw.len() - 1])?;

    if ResponseCode::from_byte(code).is_none() {
        tracing::warn!(
            command = %spec.name,
            code,
            "unrecognized response code (likely verbosity misalignment)"
        );
    }

    Ok(CommandResponse::Binary { code, ret })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::layout::ArgLayout;
    use pretty_assertions::assert_eq;

    fn spec(name: &str, id: u16, args: &str, ret: &str) -> CommandSpec {
        CommandSpec {
            name: name.to_string(),
            service: crate::catalog::ServiceId::SlowControl,
            handler: format!("cmd_{}", name.to_lowercase()),
            id,
            args: ArgLayout::parse(args).unwrap(),
            ret: ArgLayout::parse(ret).unwrap(),
        }
    }

    #[test]
    fn ascii_encoding() {
        let spec = spec("send_batch", 0x3040, "iB", "");
        let line = encode_ascii(&spec, &[Value::Int(-1), Value::Int(1)]);
        assert_eq!(line, b"SEND_BATCH -1 1\n".to_vec());
    }

    #[test]
    fn ascii_encoding_no_args() {
        let spec = spec("status", 0x3031, "", "");
        assert_eq!(encode_ascii(&spec, &[]), b"STATUS\n".to_vec());
    }

    #[test]
    fn binary_encoding_roundtrips_command_id() {
        let spec = spec("dac", 0x3038, "BH", "");
        let wire = encode_binary(&spec, &[Value::Int(1), Value::Int(2000)]).unwrap();
        let (id, packed) = decode_binary(&wire).unwrap();
        assert_eq!(id, 0x3038);
        assert_eq!(packed, vec![0x01, 0x07, 0xd0]);
    }

    #[test]
    fn binary_encoding_is_zero_free() {
        // The raw header always contains zeros; the stuffing must remove
        // every one of them.
        let catalog = Catalog::builtin();
        for spec in catalog.iter().filter(|s| s.args.is_empty()) {
            let wire = encode_binary(spec, &[]).unwrap();
            assert!(
                !wire.contains(&0x00),
                "{} encoding contains a zero byte",
                spec.name
            );
        }
    }

    #[test]
    fn readback_decoding() {
        // One u8 return value, device replies [0x05, 'a'].
        let spec = spec("fetch", 0x3030, "", "B");
        let resp = decode_readback(&spec, &[0x05, 0x61]).unwrap();
        assert_eq!(resp.code(), Some(ResponseCode::Ok));
        assert_eq!(resp.ret(), &[Value::Int(5)]);
        assert!(resp.is_ok());
    }

    #[test]
    fn readback_uses_last_bytes_only() {
        // Preamble bytes before the readback proper are ignored.
        let spec = spec("fetch", 0x3030, "", "H");
        let raw = [b'j', b'u', b'n', b'k', 0x01, 0x02, 0x61];
        let resp = decode_readback(&spec, &raw).unwrap();
        assert_eq!(resp.ret(), &[Value::Int(0x0102)]);
        assert!(resp.is_ok());
    }

    #[test]
    fn readback_return_roundtrip() {
        let spec = spec("stats", 0x3030, "", "II");
        let mut raw = spec
            .ret
            .pack(&[Value::Int(1234), Value::Int(567_890)])
            .unwrap();
        raw.push(ResponseCode::Ok.byte());
        let resp = decode_readback(&spec, &raw).unwrap();
        assert_eq!(resp.ret(), &[Value::Int(1234), Value::Int(567_890)]);
    }

    #[test]
    fn short_readback_is_an_error() {
        let spec = spec("stats", 0x3030, "", "II");
        let err = decode_readback(&spec, &[0x61]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortReadback {
                expected: 9,
                got: 1
            }
        ));
    }

    #[test]
    fn unrecognized_code_is_tolerated() {
        let spec = spec("ok", 0x3030, "", "");
        let resp = decode_readback(&spec, &[0x2a]).unwrap();
        assert_eq!(resp.code(), None);
        assert!(!resp.is_ok());
        match resp {
            CommandResponse::Binary { code, .. } => assert_eq!(code, 0x2a),
            _ => panic!("expected binary response"),
        }
    }
}
