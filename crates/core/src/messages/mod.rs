//! Message catalogue.
//!
//! Every message class is a static [`Schema`] built once on first use. The
//! codec is generic; these modules only declare layouts and a few typed
//! views for the notifications the runtime itself reacts to.

pub mod hidpp10;
pub mod hidpp20;
pub mod notifications;

use crate::codec::{HeaderKind, Message, MessageKind, Schema, SchemaBuilder};
use crate::error::CodecError;
use crate::hidpp::{HIDPP1_ERROR_TAG, HIDPP2_ERROR_TAG, LONG_REPORT_LEN, SHORT_REPORT_LEN};
use lazy_static::lazy_static;

lazy_static! {
    /// Opaque pass-through for non-HID++ reports (mouse, keyboard, consumer).
    pub static ref HID_REPORT: Schema =
        Schema::builder("HidReport", MessageKind::Hid, HeaderKind::None, 0)
            .bytes("data", 0)
            .build();

    /// `[rid, dev, 0xFF, feature_index, function_sw, code, ..]`; long error
    /// reports decode through the same short layout.
    pub static ref HIDPP2_ERROR: Schema = Schema::builder(
        "Hidpp2ErrorCodes",
        MessageKind::Error,
        HeaderKind::Hidpp10 { sub_id: HIDPP2_ERROR_TAG, address: None },
        SHORT_REPORT_LEN,
    )
    .uint("feature_index", 8)
    .uint("function_index", 4)
    .uint("software_id", 4)
    .uint("error_code", 8)
    .padding(8)
    .build();

    /// `[0x10, dev, 0x8F, sub_id, address, code, 0]`.
    pub static ref HIDPP1_ERROR: Schema = Schema::builder(
        "Hidpp1ErrorCodes",
        MessageKind::Error,
        HeaderKind::Hidpp10 { sub_id: HIDPP1_ERROR_TAG, address: None },
        SHORT_REPORT_LEN,
    )
    .uint("sub_id", 8)
    .uint("address", 8)
    .uint("error_code", 8)
    .padding(8)
    .build();
}

pub(crate) fn feature_short(name: &'static str, kind: MessageKind, function: u8) -> SchemaBuilder {
    Schema::builder(name, kind, HeaderKind::Hidpp20 { function }, SHORT_REPORT_LEN)
}

pub(crate) fn feature_long(name: &'static str, kind: MessageKind, function: u8) -> SchemaBuilder {
    Schema::builder(name, kind, HeaderKind::Hidpp20 { function }, LONG_REPORT_LEN)
}

pub(crate) fn register_short(
    name: &'static str,
    kind: MessageKind,
    sub_id: u8,
    address: u8,
) -> SchemaBuilder {
    Schema::builder(
        name,
        kind,
        HeaderKind::Hidpp10 {
            sub_id,
            address: Some(address),
        },
        SHORT_REPORT_LEN,
    )
}

pub(crate) fn register_long(
    name: &'static str,
    kind: MessageKind,
    sub_id: u8,
    address: u8,
) -> SchemaBuilder {
    Schema::builder(
        name,
        kind,
        HeaderKind::Hidpp10 {
            sub_id,
            address: Some(address),
        },
        LONG_REPORT_LEN,
    )
}

pub(crate) fn notification(name: &'static str, sub_id: u8, length: usize) -> SchemaBuilder {
    Schema::builder(
        name,
        MessageKind::Event,
        HeaderKind::Hidpp10 {
            sub_id,
            address: None,
        },
        length,
    )
}

/// Every schema declared by the catalogue.
pub fn all_schemas() -> Vec<&'static Schema> {
    let mut schemas: Vec<&'static Schema> = vec![&*HID_REPORT, &*HIDPP2_ERROR, &*HIDPP1_ERROR];
    schemas.extend(hidpp20::schemas());
    schemas.extend(hidpp10::schemas());
    schemas.extend(notifications::schemas());
    schemas
}

/// Ensure a typed view is built over the right class.
pub(crate) fn expect_schema(message: &Message, schema: &'static Schema) -> Result<(), CodecError> {
    if message.is(schema) {
        Ok(())
    } else {
        Err(CodecError::SchemaMismatch {
            expected: schema.name,
            actual: message.name(),
        })
    }
}

pub(crate) fn uint(message: &Message, field: &str) -> Result<u64, CodecError> {
    message.get(field).ok_or_else(|| CodecError::UnknownField {
        schema: message.name(),
        field: field.to_string(),
    })
}

pub(crate) fn byte_array<const N: usize>(message: &Message, field: &str) -> Result<[u8; N], CodecError> {
    let bytes = message.bytes(field).ok_or_else(|| CodecError::UnknownField {
        schema: message.name(),
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| CodecError::LengthMismatch {
        schema: message.name(),
        expected: N,
        actual: bytes.len(),
    })
}
