//! Packed binary value layouts
//!
//! Command argument and return-value layouts are expressed as short format
//! strings shared with the front-end firmware's command table, e.g. `"BH"`,
//! `"If"`, `"30sb30sb"`. Each code names one primitive field; a decimal
//! prefix is a repeat count, except before `s` where it is the byte length
//! of a fixed-size string field. All multi-byte fields are big-endian on
//! the wire.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// One primitive field of a packed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `b` — signed 8-bit
    Int8,
    /// `B` — unsigned 8-bit
    UInt8,
    /// `h` — signed 16-bit
    Int16,
    /// `H` — unsigned 16-bit
    UInt16,
    /// `i` — signed 32-bit
    Int32,
    /// `I` — unsigned 32-bit
    UInt32,
    /// `q` — signed 64-bit
    Int64,
    /// `Q` — unsigned 64-bit
    UInt64,
    /// `f` — 32-bit float
    Float32,
    /// `d` — 64-bit float
    Float64,
    /// `<N>s` — fixed-length byte string, NUL-padded
    Str(usize),
}

impl Field {
    /// Packed size of the field in bytes.
    pub fn size(self) -> usize {
        match self {
            Field::Int8 | Field::UInt8 => 1,
            Field::Int16 | Field::UInt16 => 2,
            Field::Int32 | Field::UInt32 | Field::Float32 => 4,
            Field::Int64 | Field::UInt64 | Field::Float64 => 8,
            Field::Str(n) => n,
        }
    }
}

/// A decoded or to-be-encoded primitive value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Integer contents, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Layout description or pack/unpack failure.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unknown layout code {code:?} in {fmt:?}")]
    UnknownCode { code: char, fmt: String },

    #[error("string field in {fmt:?} is missing its length prefix")]
    MissingLength { fmt: String },

    #[error("expected {expected} values, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("value {value:?} does not fit field {field:?}")]
    ValueMismatch { field: Field, value: Value },

    #[error("buffer too short: layout needs {expected} bytes, got {got}")]
    ShortBuffer { expected: usize, got: usize },

    #[error("decoded value of field {field:?} exceeds the representable range")]
    Unrepresentable { field: Field },
}

/// An ordered sequence of packed fields parsed from a format string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgLayout {
    fields: Vec<Field>,
    source: String,
}

impl ArgLayout {
    /// Parse a firmware-style format string into a layout.
    pub fn parse(fmt: &str) -> Result<Self, LayoutError> {
        let mut fields = Vec::new();
        let mut count: Option<usize> = None;

        for c in fmt.chars() {
            if c.is_ascii_whitespace() {
                continue;
            }
            if let Some(d) = c.to_digit(10) {
                count = Some(count.unwrap_or(0) * 10 + d as usize);
                continue;
            }
            if c == 's' {
                let n = count.take().ok_or_else(|| LayoutError::MissingLength {
                    fmt: fmt.to_string(),
                })?;
                fields.push(Field::Str(n));
                continue;
            }
            let field = match c {
                'b' => Field::Int8,
                'B' => Field::UInt8,
                'h' => Field::Int16,
                'H' => Field::UInt16,
                'i' | 'l' => Field::Int32,
                'I' | 'L' => Field::UInt32,
                'q' => Field::Int64,
                'Q' => Field::UInt64,
                'f' => Field::Float32,
                'd' => Field::Float64,
                _ => {
                    return Err(LayoutError::UnknownCode {
                        code: c,
                        fmt: fmt.to_string(),
                    })
                }
            };
            // A numeric prefix before a non-string code is a repeat count.
            for _ in 0..count.take().unwrap_or(1) {
                fields.push(field);
            }
        }

        Ok(Self {
            fields,
            source: fmt.to_string(),
        })
    }

    /// The format string this layout was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the layout has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total packed size in bytes.
    pub fn packed_size(&self) -> usize {
        self.fields.iter().map(|f| f.size()).sum()
    }

    /// Pack `values` into big-endian bytes, in field order.
    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>, LayoutError> {
        if values.len() != self.fields.len() {
            return Err(LayoutError::ArityMismatch {
                expected: self.fields.len(),
                got: values.len(),
            });
        }

        let mut out = Vec::with_capacity(self.packed_size());
        for (field, value) in self.fields.iter().zip(values) {
            pack_one(*field, value, &mut out)?;
        }
        Ok(out)
    }

    /// Unpack big-endian bytes into values, in field order.
    ///
    /// `raw` must be at least `packed_size()` bytes; extra trailing bytes
    /// are ignored.
    pub fn unpack(&self, raw: &[u8]) -> Result<Vec<Value>, LayoutError> {
        let need = self.packed_size();
        if raw.len() < need {
            return Err(LayoutError::ShortBuffer {
                expected: need,
                got: raw.len(),
            });
        }

        let mut values = Vec::with_capacity(self.fields.len());
        let mut offset = 0;
        for field in &self.fields {
            let chunk = &raw[offset..offset + field.size()];
            values.push(unpack_one(*field, chunk)?);
            offset += field.size();
        }
        Ok(values)
    }
}

fn int_in_range(field: Field, value: &Value, min: i64, max: i64) -> Result<i64, LayoutError> {
    match value {
        Value::Int(v) if *v >= min && *v <= max => Ok(*v),
        _ => Err(LayoutError::ValueMismatch {
            field,
            value: value.clone(),
        }),
    }
}

fn float_of(field: Field, value: &Value) -> Result<f64, LayoutError> {
    match value {
        Value::Float(v) => Ok(*v),
        Value::Int(v) => Ok(*v as f64),
        Value::Str(_) => Err(LayoutError::ValueMismatch {
            field,
            value: value.clone(),
        }),
    }
}

fn pack_one(field: Field, value: &Value, out: &mut Vec<u8>) -> Result<(), LayoutError> {
    match field {
        Field::Int8 => out.push(int_in_range(field, value, i8::MIN as i64, i8::MAX as i64)? as u8),
        Field::UInt8 => out.push(int_in_range(field, value, 0, u8::MAX as i64)? as u8),
        Field::Int16 => {
            let v = int_in_range(field, value, i16::MIN as i64, i16::MAX as i64)?;
            let mut buf = [0u8; 2];
            BigEndian::write_i16(&mut buf, v as i16);
            out.extend_from_slice(&buf);
        }
        Field::UInt16 => {
            let v = int_in_range(field, value, 0, u16::MAX as i64)?;
            let mut buf = [0u8; 2];
            BigEndian::write_u16(&mut buf, v as u16);
            out.extend_from_slice(&buf);
        }
        Field::Int32 => {
            let v = int_in_range(field, value, i32::MIN as i64, i32::MAX as i64)?;
            let mut buf = [0u8; 4];
            BigEndian::write_i32(&mut buf, v as i32);
            out.extend_from_slice(&buf);
        }
        Field::UInt32 => {
            let v = int_in_range(field, value, 0, u32::MAX as i64)?;
            let mut buf = [0u8; 4];
            BigEndian::write_u32(&mut buf, v as u32);
            out.extend_from_slice(&buf);
        }
        Field::Int64 => {
            let v = int_in_range(field, value, i64::MIN, i64::MAX)?;
            let mut buf = [0u8; 8];
            BigEndian::write_i64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        Field::UInt64 => {
            let v = int_in_range(field, value, 0, i64::MAX)?;
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, v as u64);
            out.extend_from_slice(&buf);
        }
        Field::Float32 => {
            let v = float_of(field, value)?;
            let mut buf = [0u8; 4];
            BigEndian::write_f32(&mut buf, v as f32);
            out.extend_from_slice(&buf);
        }
        Field::Float64 => {
            let v = float_of(field, value)?;
            let mut buf = [0u8; 8];
            BigEndian::write_f64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        Field::Str(n) => match value {
            Value::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > n {
                    return Err(LayoutError::ValueMismatch {
                        field,
                        value: value.clone(),
                    });
                }
                out.extend_from_slice(bytes);
                out.resize(out.len() + (n - bytes.len()), 0);
            }
            _ => {
                return Err(LayoutError::ValueMismatch {
                    field,
                    value: value.clone(),
                })
            }
        },
    }
    Ok(())
}

fn unpack_one(field: Field, chunk: &[u8]) -> Result<Value, LayoutError> {
    let value = match field {
        Field::Int8 => Value::Int(chunk[0] as i8 as i64),
        Field::UInt8 => Value::Int(chunk[0] as i64),
        Field::Int16 => Value::Int(BigEndian::read_i16(chunk) as i64),
        Field::UInt16 => Value::Int(BigEndian::read_u16(chunk) as i64),
        Field::Int32 => Value::Int(BigEndian::read_i32(chunk) as i64),
        Field::UInt32 => Value::Int(BigEndian::read_u32(chunk) as i64),
        Field::Int64 => Value::Int(BigEndian::read_i64(chunk)),
        Field::UInt64 => {
            let v = BigEndian::read_u64(chunk);
            if v > i64::MAX as u64 {
                return Err(LayoutError::Unrepresentable { field });
            }
            Value::Int(v as i64)
        }
        Field::Float32 => Value::Float(BigEndian::read_f32(chunk) as f64),
        Field::Float64 => Value::Float(BigEndian::read_f64(chunk)),
        Field::Str(_) => {
            // Fixed-size string fields are NUL-padded by the firmware.
            let end = chunk
                .iter()
                .rposition(|&b| b != 0)
                .map(|i| i + 1)
                .unwrap_or(0);
            Value::Str(String::from_utf8_lossy(&chunk[..end]).into_owned())
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_codes() {
        let layout = ArgLayout::parse("BHf").unwrap();
        assert_eq!(
            layout.fields(),
            &[Field::UInt8, Field::UInt16, Field::Float32]
        );
        assert_eq!(layout.packed_size(), 7);
    }

    #[test]
    fn parse_version_layout() {
        // The version command's override layout: two 30-byte strings, each
        // followed by one signed byte.
        let layout = ArgLayout::parse("30sb30sb").unwrap();
        assert_eq!(
            layout.fields(),
            &[Field::Str(30), Field::Int8, Field::Str(30), Field::Int8]
        );
        assert_eq!(layout.packed_size(), 62);
    }

    #[test]
    fn parse_repeat_prefix() {
        let layout = ArgLayout::parse("3H").unwrap();
        assert_eq!(layout.fields(), &[Field::UInt16; 3]);
    }

    #[test]
    fn parse_rejects_unknown_code() {
        assert!(matches!(
            ArgLayout::parse("Hx"),
            Err(LayoutError::UnknownCode { code: 'x', .. })
        ));
    }

    #[test]
    fn pack_is_big_endian() {
        let layout = ArgLayout::parse("Hi").unwrap();
        let raw = layout
            .pack(&[Value::Int(0x0102), Value::Int(-2)])
            .unwrap();
        assert_eq!(raw, vec![0x01, 0x02, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let layout = ArgLayout::parse("bBhHiIqQfd").unwrap();
        let values = vec![
            Value::Int(-5),
            Value::Int(200),
            Value::Int(-1000),
            Value::Int(40000),
            Value::Int(-100_000),
            Value::Int(3_000_000_000),
            Value::Int(-1),
            Value::Int(1),
            Value::Float(1.5),
            Value::Float(-2.25),
        ];
        let raw = layout.pack(&values).unwrap();
        assert_eq!(raw.len(), layout.packed_size());
        assert_eq!(layout.unpack(&raw).unwrap(), values);
    }

    #[test]
    fn string_field_roundtrip() {
        let layout = ArgLayout::parse("8sB").unwrap();
        let raw = layout
            .pack(&[Value::Str("fw-1.2".into()), Value::Int(7)])
            .unwrap();
        assert_eq!(raw.len(), 9);
        let values = layout.unpack(&raw).unwrap();
        assert_eq!(values[0], Value::Str("fw-1.2".into()));
        assert_eq!(values[1], Value::Int(7));
    }

    #[test]
    fn pack_rejects_out_of_range() {
        let layout = ArgLayout::parse("B").unwrap();
        assert!(layout.pack(&[Value::Int(300)]).is_err());
        assert!(layout.pack(&[Value::Int(-1)]).is_err());
    }

    #[test]
    fn pack_rejects_wrong_arity() {
        let layout = ArgLayout::parse("HH").unwrap();
        assert!(matches!(
            layout.pack(&[Value::Int(1)]),
            Err(LayoutError::ArityMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn unpack_rejects_short_buffer() {
        let layout = ArgLayout::parse("I").unwrap();
        assert!(matches!(
            layout.unpack(&[0x00, 0x01]),
            Err(LayoutError::ShortBuffer {
                expected: 4,
                got: 2
            })
        ));
    }

    #[test]
    fn float_field_accepts_integer_value() {
        let layout = ArgLayout::parse("f").unwrap();
        let raw = layout.pack(&[Value::Int(2)]).unwrap();
        assert_eq!(layout.unpack(&raw).unwrap(), vec![Value::Float(2.0)]);
    }
}
