//! Declarative bitfield codec.
//!
//! A [`Schema`] is an ordered list of field descriptors laid out MSB-first
//! after an optional HID++ header. Offsets are computed once when the schema
//! is built, so encoding and decoding are single passes over the field table.
//!
//! Encoding range-checks every integer field against its width and declared
//! [`Check`]; the first violation aborts the whole encode. Decoding never
//! re-checks: whatever the device sent is handed to the caller as-is.

use crate::error::CodecError;
use crate::hidpp::{self, Header, LONG_REPORT_LEN, SHORT_REPORT_LEN};
use std::fmt;

/// Value predicate attached to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Any value that fits the width.
    Any,
    /// Inclusive range.
    Range { min: u64, max: u64 },
    /// Explicit list of accepted values.
    OneOf(&'static [u64]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Up to 64 bits, any alignment.
    Uint,
    /// Byte-aligned opaque bytes (addresses, keys, names).
    Bytes,
}

/// One field of a message layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Bit offset from the start of the body (after the header).
    pub offset: usize,
    /// Width in bits.
    pub width: usize,
    pub kind: FieldKind,
    pub check: Check,
    pub default: u64,
}

impl FieldSpec {
    fn check_value(&self, schema: &'static str, value: u64) -> Result<(), CodecError> {
        let out_of_range = || CodecError::ValueOutOfRange {
            schema,
            field: self.name,
            value,
        };
        if self.width < 64 && value >> self.width != 0 {
            return Err(out_of_range());
        }
        match self.check {
            Check::Any => Ok(()),
            Check::Range { min, max } if value < min || value > max => Err(out_of_range()),
            Check::Range { .. } => Ok(()),
            Check::OneOf(allowed) if !allowed.contains(&value) => Err(out_of_range()),
            Check::OneOf(_) => Ok(()),
        }
    }
}

/// Message category, used for queue routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Error,
    /// Header-less structure (NVS chunks, notification sub-payloads).
    Structure,
    /// Non-HID++ report passed through untouched.
    Hid,
}

/// Which header precedes the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    None,
    /// `[rid, dev, feature_index, function<<4 | sw_id]`.
    Hidpp20 { function: u8 },
    /// `[rid, dev, sub_id, address]`, or `[rid, dev, sub_id]` when the
    /// fourth byte belongs to the body (notifications).
    Hidpp10 { sub_id: u8, address: Option<u8> },
}

impl HeaderKind {
    pub fn len(&self) -> usize {
        match self {
            HeaderKind::None => 0,
            HeaderKind::Hidpp20 { .. } => hidpp::HEADER_LEN,
            HeaderKind::Hidpp10 { address: Some(_), .. } => hidpp::HEADER_LEN,
            HeaderKind::Hidpp10 { address: None, .. } => hidpp::HEADER_LEN - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Static description of one message class.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: &'static str,
    pub kind: MessageKind,
    pub header: HeaderKind,
    /// Total length in bytes; 0 for variable-length pass-through reports.
    pub length: usize,
    pub fields: Vec<FieldSpec>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Schema {}

impl Schema {
    pub fn builder(
        name: &'static str,
        kind: MessageKind,
        header: HeaderKind,
        length: usize,
    ) -> SchemaBuilder {
        SchemaBuilder {
            schema: Schema {
                name,
                kind,
                header,
                length,
                fields: Vec::new(),
            },
            cursor: 0,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.length == 0
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldSpec)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    /// Check the layout invariants: fields are contiguous, byte fields are
    /// byte-aligned, and header plus body exactly fill the declared length.
    pub fn validate(&self) -> Result<(), CodecError> {
        let mismatch = |actual_bits: usize| CodecError::LengthMismatch {
            schema: self.name,
            expected: self.length,
            actual: actual_bits.div_ceil(8),
        };

        if self.is_variable() {
            return match self.fields.as_slice() {
                [only] if only.kind == FieldKind::Bytes => Ok(()),
                _ => Err(mismatch(0)),
            };
        }

        if !self.header.is_empty() && self.length != SHORT_REPORT_LEN && self.length != LONG_REPORT_LEN
        {
            return Err(mismatch(self.length * 8));
        }

        let mut cursor = 0;
        for field in &self.fields {
            if field.offset != cursor || field.width == 0 {
                return Err(mismatch(self.header.len() * 8 + cursor));
            }
            let aligned = (self.header.len() * 8 + field.offset) % 8 == 0 && field.width % 8 == 0;
            match field.kind {
                FieldKind::Uint if field.width > 64 => {
                    return Err(CodecError::KindMismatch {
                        schema: self.name,
                        field: field.name,
                    })
                }
                FieldKind::Bytes if !aligned => {
                    return Err(CodecError::KindMismatch {
                        schema: self.name,
                        field: field.name,
                    })
                }
                _ => {}
            }
            cursor += field.width;
        }

        let total_bits = self.header.len() * 8 + cursor;
        if total_bits != self.length * 8 {
            return Err(mismatch(total_bits));
        }
        Ok(())
    }
}

/// Builds a [`Schema`], assigning offsets in declaration order.
pub struct SchemaBuilder {
    schema: Schema,
    cursor: usize,
}

impl SchemaBuilder {
    fn push(mut self, name: &'static str, width: usize, kind: FieldKind, check: Check, default: u64) -> Self {
        self.schema.fields.push(FieldSpec {
            name,
            offset: self.cursor,
            width,
            kind,
            check,
            default,
        });
        self.cursor += width;
        self
    }

    pub fn uint(self, name: &'static str, width: usize) -> Self {
        self.push(name, width, FieldKind::Uint, Check::Any, 0)
    }

    pub fn checked(self, name: &'static str, width: usize, check: Check) -> Self {
        self.push(name, width, FieldKind::Uint, check, 0)
    }

    pub fn with_default(self, name: &'static str, width: usize, default: u64) -> Self {
        self.push(name, width, FieldKind::Uint, Check::Any, default)
    }

    /// Opaque byte field of `len` bytes.
    pub fn bytes(self, name: &'static str, len: usize) -> Self {
        self.push(name, len * 8, FieldKind::Bytes, Check::Any, 0)
    }

    pub fn padding(self, width: usize) -> Self {
        self.push("padding", width, FieldKind::Uint, Check::Any, 0)
    }

    /// Pad the body up to the declared length.
    pub fn pad_to_end(self) -> Self {
        let total = self.schema.length * 8;
        let used = self.schema.header.len() * 8 + self.cursor;
        if total > used {
            let remaining = total - used;
            if remaining % 8 == 0 && used % 8 == 0 {
                self.push("padding", remaining, FieldKind::Bytes, Check::Any, 0)
            } else {
                self.padding(remaining)
            }
        } else {
            self
        }
    }

    pub fn build(self) -> Schema {
        debug_assert!(
            self.schema.validate().is_ok(),
            "invalid layout for {}",
            self.schema.name
        );
        self.schema
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Uint(u64),
    Bytes(Vec<u8>),
}

/// A message instance: schema, header and one value per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    schema: &'static Schema,
    pub header: Header,
    values: Vec<Value>,
}

impl Message {
    /// New message with every field at its default.
    pub fn new(schema: &'static Schema) -> Self {
        let report_id = hidpp::report_id_for_len(schema.length).unwrap_or(0);
        let header = match schema.header {
            HeaderKind::None => Header::default(),
            HeaderKind::Hidpp20 { function } => Header {
                report_id,
                device_index: 0,
                feature_index: 0,
                function_sw: (function & 0x0F) << 4,
            },
            HeaderKind::Hidpp10 { sub_id, address } => Header {
                report_id,
                device_index: hidpp::RECEIVER_DEVICE_INDEX,
                feature_index: sub_id,
                function_sw: address.unwrap_or(0),
            },
        };
        let values = schema
            .fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Uint => Value::Uint(f.default),
                FieldKind::Bytes => Value::Bytes(vec![0; f.width / 8]),
            })
            .collect();
        Self {
            schema,
            header,
            values,
        }
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    /// Whether this message is an instance of `schema`.
    pub fn is(&self, schema: &Schema) -> bool {
        self.schema == schema
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        let (idx, _) = self.schema.field(name)?;
        match &self.values[idx] {
            Value::Uint(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        let (idx, _) = self.schema.field(name)?;
        match &self.values[idx] {
            Value::Bytes(b) => Some(b),
            Value::Uint(_) => None,
        }
    }

    fn slot(&mut self, name: &str, kind: FieldKind) -> Result<&mut Value, CodecError> {
        let schema = self.schema;
        let (idx, spec) = schema.field(name).ok_or_else(|| CodecError::UnknownField {
            schema: schema.name,
            field: name.to_string(),
        })?;
        if spec.kind != kind {
            return Err(CodecError::KindMismatch {
                schema: schema.name,
                field: spec.name,
            });
        }
        Ok(&mut self.values[idx])
    }

    /// Set an integer field. Range checks happen at encode time.
    pub fn set(&mut self, name: &str, value: u64) -> Result<(), CodecError> {
        *self.slot(name, FieldKind::Uint)? = Value::Uint(value);
        Ok(())
    }

    pub fn set_bytes(&mut self, name: &str, value: &[u8]) -> Result<(), CodecError> {
        *self.slot(name, FieldKind::Bytes)? = Value::Bytes(value.to_vec());
        Ok(())
    }

    pub fn with(mut self, name: &str, value: u64) -> Result<Self, CodecError> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn with_bytes(mut self, name: &str, value: &[u8]) -> Result<Self, CodecError> {
        self.set_bytes(name, value)?;
        Ok(self)
    }

    pub fn with_device_index(mut self, device_index: u8) -> Self {
        self.header.device_index = device_index;
        self
    }

    pub fn with_feature_index(mut self, feature_index: u8) -> Self {
        self.header.feature_index = feature_index;
        self
    }

    /// Field names and values in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.schema
            .fields
            .iter()
            .map(|f| f.name)
            .zip(self.values.iter())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(dev=0x{:02X}, idx=0x{:02X}, fsw=0x{:02X}",
            self.schema.name,
            self.header.device_index,
            self.header.feature_index,
            self.header.function_sw
        )?;
        for (name, value) in self.fields() {
            if name == "padding" {
                continue;
            }
            match value {
                Value::Uint(v) => write!(f, ", {name}=0x{v:X}")?,
                Value::Bytes(b) => write!(f, ", {name}={b:02X?}")?,
            }
        }
        write!(f, ")")
    }
}

fn read_bits(buf: &[u8], offset: usize, width: usize) -> u64 {
    let mut value = 0u64;
    for i in 0..width {
        let bit = offset + i;
        let b = (buf[bit / 8] >> (7 - bit % 8)) & 1;
        value = (value << 1) | u64::from(b);
    }
    value
}

fn write_bits(buf: &mut [u8], offset: usize, width: usize, value: u64) {
    for i in 0..width {
        let bit = offset + i;
        let mask = 1u8 << (7 - bit % 8);
        if (value >> (width - 1 - i)) & 1 == 1 {
            buf[bit / 8] |= mask;
        } else {
            buf[bit / 8] &= !mask;
        }
    }
}

/// Serialize a message to its exact category length.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let schema = message.schema;

    if schema.is_variable() {
        return match message.values.first() {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            _ => Err(CodecError::LengthMismatch {
                schema: schema.name,
                expected: 0,
                actual: 0,
            }),
        };
    }

    let mut buf = vec![0u8; schema.length];
    let header_len = schema.header.len();
    buf[..header_len].copy_from_slice(&message.header.to_bytes()[..header_len]);

    for (spec, value) in schema.fields.iter().zip(&message.values) {
        let bit_offset = header_len * 8 + spec.offset;
        match (spec.kind, value) {
            (FieldKind::Uint, Value::Uint(v)) => {
                spec.check_value(schema.name, *v)?;
                write_bits(&mut buf, bit_offset, spec.width, *v);
            }
            (FieldKind::Bytes, Value::Bytes(b)) => {
                let len = spec.width / 8;
                if b.len() != len {
                    return Err(CodecError::LengthMismatch {
                        schema: schema.name,
                        expected: len,
                        actual: b.len(),
                    });
                }
                let start = bit_offset / 8;
                buf[start..start + len].copy_from_slice(b);
            }
            _ => {
                return Err(CodecError::KindMismatch {
                    schema: schema.name,
                    field: spec.name,
                })
            }
        }
    }
    Ok(buf)
}

/// Deserialize `data` as an instance of `schema`.
///
/// Extra trailing bytes are ignored so a short-report layout can read the
/// front of a long report.
pub fn decode(data: &[u8], schema: &'static Schema) -> Result<Message, CodecError> {
    if schema.is_variable() {
        let mut message = Message::new(schema);
        message.values = vec![Value::Bytes(data.to_vec())];
        if let Some(&report_id) = data.first() {
            message.header.report_id = report_id;
        }
        return Ok(message);
    }

    if data.len() < schema.length {
        return Err(CodecError::LengthMismatch {
            schema: schema.name,
            expected: schema.length,
            actual: data.len(),
        });
    }

    let header_len = schema.header.len();
    let mut raw_header = [0u8; hidpp::HEADER_LEN];
    raw_header[..header_len].copy_from_slice(&data[..header_len]);
    let header = Header {
        report_id: raw_header[0],
        device_index: raw_header[1],
        feature_index: raw_header[2],
        function_sw: raw_header[3],
    };

    let values = schema
        .fields
        .iter()
        .map(|spec| {
            let bit_offset = header_len * 8 + spec.offset;
            match spec.kind {
                FieldKind::Uint => Value::Uint(read_bits(data, bit_offset, spec.width)),
                FieldKind::Bytes => {
                    let start = bit_offset / 8;
                    Value::Bytes(data[start..start + spec.width / 8].to_vec())
                }
            }
        })
        .collect();

    Ok(Message {
        schema,
        header,
        values,
    })
}
