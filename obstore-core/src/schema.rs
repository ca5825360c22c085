//! Stream schemas and the tuple encoding used for record payloads.
//!
//! The store does not interpret what fields mean. A schema only describes how
//! a payload is framed, so malformed payloads can be rejected at ingestion,
//! and which two numeric fields hold the observation location.
//!
//! Payloads are the concatenation of their fields in schema order. Numbers are
//! little-endian; `Bool` and `U8` take one byte; `Text` is a `u32` byte length
//! followed by UTF-8.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primitive type of one payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// One byte, `0` or `1`.
    Bool,
    /// Unsigned byte.
    U8,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Length-prefixed UTF-8 string.
    Text,
}

impl FieldKind {
    const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::U8 => Some(1),
            Self::I32 | Self::F32 => Some(4),
            Self::I64 | Self::F64 => Some(8),
            Self::Text => None,
        }
    }

    const fn is_numeric(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::F32 | Self::F64)
    }
}

/// Positions of the x and y coordinates inside a payload tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationFields {
    /// Field index of the x (longitude/easting) coordinate.
    pub x: usize,
    /// Field index of the y (latitude/northing) coordinate.
    pub y: usize,
}

/// Errors raised when a schema definition itself is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaDefinitionError {
    /// The schema has no fields.
    #[error("schema must declare at least one field")]
    Empty,
    /// A location field index does not exist.
    #[error("location field {index} is out of range for {len} fields")]
    LocationOutOfRange {
        /// Offending field index.
        index: usize,
        /// Number of declared fields.
        len: usize,
    },
    /// A location field is not numeric.
    #[error("location field {index} must be numeric, found {kind:?}")]
    NonNumericLocation {
        /// Offending field index.
        index: usize,
        /// Declared kind.
        kind: FieldKind,
    },
}

/// Errors raised when a payload does not match its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The payload ended in the middle of a field.
    #[error("payload truncated in field {field} at byte {offset}")]
    Truncated {
        /// Field index being decoded.
        field: usize,
        /// Byte offset where decoding stopped.
        offset: usize,
    },
    /// Bytes remain after the last field.
    #[error("payload has {extra} trailing bytes after the last field")]
    TrailingBytes {
        /// Number of unexpected bytes.
        extra: usize,
    },
    /// A boolean byte was neither 0 nor 1.
    #[error("field {field} holds invalid boolean byte {value}")]
    InvalidBool {
        /// Field index.
        field: usize,
        /// Byte found.
        value: u8,
    },
    /// A text field was not valid UTF-8.
    #[error("field {field} holds invalid UTF-8 text")]
    InvalidText {
        /// Field index.
        field: usize,
    },
    /// A field was read with the wrong kind.
    #[error("field {field} is {actual:?}, not {expected:?}")]
    KindMismatch {
        /// Field index.
        field: usize,
        /// Kind requested by the caller.
        expected: FieldKind,
        /// Kind declared by the schema.
        actual: FieldKind,
    },
    /// The field index does not exist.
    #[error("field {field} does not exist")]
    NoSuchField {
        /// Field index.
        field: usize,
    },
}

/// Description of the records of one stream.
///
/// # Examples
///
/// ```
/// use obstore_core::{FieldKind, RecordSchema, TupleWriter};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let schema = RecordSchema::new("track", vec![FieldKind::F64, FieldKind::F64, FieldKind::F64])?
///     .with_location(1, 2)?;
/// let payload = TupleWriter::new().f64(12.0).f64(3.5).f64(-1.0).finish();
/// assert_eq!(schema.location(&payload)?, Some((3.5, -1.0)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Free-form description owned by the schema facility.
    pub description: String,
    /// Field kinds in tuple order.
    pub fields: Vec<FieldKind>,
    /// Location fields, when records carry a position.
    pub location: Option<LocationFields>,
}

impl RecordSchema {
    /// Validate and build a schema without location fields.
    pub fn new(
        description: impl Into<String>,
        fields: Vec<FieldKind>,
    ) -> Result<Self, SchemaDefinitionError> {
        if fields.is_empty() {
            return Err(SchemaDefinitionError::Empty);
        }
        Ok(Self {
            description: description.into(),
            fields,
            location: None,
        })
    }

    /// Declare which fields hold the x and y coordinates.
    pub fn with_location(mut self, x: usize, y: usize) -> Result<Self, SchemaDefinitionError> {
        self.location = Some(LocationFields { x, y });
        self.check()?;
        Ok(self)
    }

    /// Re-check a schema whose public fields were set directly.
    pub fn check(&self) -> Result<(), SchemaDefinitionError> {
        if self.fields.is_empty() {
            return Err(SchemaDefinitionError::Empty);
        }
        let Some(location) = self.location else {
            return Ok(());
        };
        for index in [location.x, location.y] {
            let kind = self.fields.get(index).copied().ok_or(
                SchemaDefinitionError::LocationOutOfRange {
                    index,
                    len: self.fields.len(),
                },
            )?;
            if !kind.is_numeric() {
                return Err(SchemaDefinitionError::NonNumericLocation { index, kind });
            }
        }
        Ok(())
    }

    /// Whether records of this schema carry a location.
    #[must_use]
    pub const fn has_location(&self) -> bool {
        self.location.is_some()
    }

    /// Check that `payload` is framed exactly as the schema declares.
    pub fn validate(&self, payload: &[u8]) -> Result<(), PayloadError> {
        let mut reader = TupleReader::new(self, payload);
        for field in 0..self.fields.len() {
            reader.skip(field)?;
        }
        let extra = payload.len().saturating_sub(reader.offset);
        if extra > 0 {
            return Err(PayloadError::TrailingBytes { extra });
        }
        Ok(())
    }

    /// Extract the `(x, y)` location of a payload.
    ///
    /// Returns `Ok(None)` when the schema has no location fields.
    pub fn location(&self, payload: &[u8]) -> Result<Option<(f64, f64)>, PayloadError> {
        let Some(location) = self.location else {
            return Ok(None);
        };
        let reader = TupleReader::new(self, payload);
        let x = reader.number(location.x)?;
        let y = reader.number(location.y)?;
        Ok(Some((x, y)))
    }
}

/// Builder for payload tuples.
#[derive(Debug, Default, Clone)]
pub struct TupleWriter {
    buf: Vec<u8>,
}

impl TupleWriter {
    /// Start an empty tuple.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a boolean field.
    #[must_use]
    pub fn bool(mut self, value: bool) -> Self {
        self.buf.push(u8::from(value));
        self
    }

    /// Append an unsigned byte field.
    #[must_use]
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    /// Append a 32-bit integer field.
    #[must_use]
    pub fn i32(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a 64-bit integer field.
    #[must_use]
    pub fn i64(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a 32-bit float field.
    #[must_use]
    pub fn f32(mut self, value: f32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a 64-bit float field.
    #[must_use]
    pub fn f64(mut self, value: f64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a text field.
    ///
    /// Strings longer than `u32::MAX` bytes are truncated to that length on a
    /// character boundary.
    #[must_use]
    pub fn text(mut self, value: &str) -> Self {
        let mut end = value.len().min(u32::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = value.as_bytes().get(..end).unwrap_or_default();
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Return the encoded payload.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Random-access reader over a payload tuple.
#[derive(Debug, Clone)]
pub struct TupleReader<'a> {
    schema: &'a RecordSchema,
    payload: &'a [u8],
    offset: usize,
}

impl<'a> TupleReader<'a> {
    /// Wrap a payload for reading.
    #[must_use]
    pub const fn new(schema: &'a RecordSchema, payload: &'a [u8]) -> Self {
        Self {
            schema,
            payload,
            offset: 0,
        }
    }

    /// Read a numeric field as `f64`, whatever its declared width.
    ///
    /// `I64` values beyond 2^53 lose precision.
    pub fn number(&self, field: usize) -> Result<f64, PayloadError> {
        let (kind, bytes) = self.field_bytes(field)?;
        let value = match kind {
            FieldKind::I32 => f64::from(i32::from_le_bytes(fixed(bytes, field)?)),
            FieldKind::I64 => i64::from_le_bytes(fixed(bytes, field)?) as f64,
            FieldKind::F32 => f64::from(f32::from_le_bytes(fixed(bytes, field)?)),
            FieldKind::F64 => f64::from_le_bytes(fixed(bytes, field)?),
            other => {
                return Err(PayloadError::KindMismatch {
                    field,
                    expected: FieldKind::F64,
                    actual: other,
                });
            }
        };
        Ok(value)
    }

    /// Read a text field.
    pub fn text(&self, field: usize) -> Result<&'a str, PayloadError> {
        let (kind, bytes) = self.field_bytes(field)?;
        if kind != FieldKind::Text {
            return Err(PayloadError::KindMismatch {
                field,
                expected: FieldKind::Text,
                actual: kind,
            });
        }
        let body = bytes.get(4..).unwrap_or_default();
        std::str::from_utf8(body).map_err(|_| PayloadError::InvalidText { field })
    }

    /// Read a boolean field.
    pub fn bool(&self, field: usize) -> Result<bool, PayloadError> {
        let (kind, bytes) = self.field_bytes(field)?;
        if kind != FieldKind::Bool {
            return Err(PayloadError::KindMismatch {
                field,
                expected: FieldKind::Bool,
                actual: kind,
            });
        }
        match bytes.first() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(&value) => Err(PayloadError::InvalidBool { field, value }),
            None => Err(PayloadError::Truncated { field, offset: 0 }),
        }
    }

    /// Read an unsigned byte field.
    pub fn u8(&self, field: usize) -> Result<u8, PayloadError> {
        let (kind, bytes) = self.field_bytes(field)?;
        if kind != FieldKind::U8 {
            return Err(PayloadError::KindMismatch {
                field,
                expected: FieldKind::U8,
                actual: kind,
            });
        }
        let [value] = fixed(bytes, field)?;
        Ok(value)
    }

    fn field_bytes(&self, field: usize) -> Result<(FieldKind, &'a [u8]), PayloadError> {
        if field >= self.schema.fields.len() {
            return Err(PayloadError::NoSuchField { field });
        }
        let mut cursor = Self::new(self.schema, self.payload);
        for earlier in 0..field {
            cursor.skip(earlier)?;
        }
        let start = cursor.offset;
        let kind = cursor.skip(field)?;
        let bytes = self
            .payload
            .get(start..cursor.offset)
            .ok_or(PayloadError::Truncated { field, offset: start })?;
        Ok((kind, bytes))
    }

    fn skip(&mut self, field: usize) -> Result<FieldKind, PayloadError> {
        let kind = *self
            .schema
            .fields
            .get(field)
            .ok_or(PayloadError::NoSuchField { field })?;
        let truncated = PayloadError::Truncated {
            field,
            offset: self.offset,
        };
        let width = match kind.fixed_width() {
            Some(width) => width,
            None => {
                let prefix: [u8; 4] = self
                    .payload
                    .get(self.offset..self.offset + 4)
                    .and_then(|slice| slice.try_into().ok())
                    .ok_or_else(|| truncated.clone())?;
                let len = u32::from_le_bytes(prefix) as usize;
                let body = self
                    .payload
                    .get(self.offset + 4..self.offset + 4 + len)
                    .ok_or_else(|| truncated.clone())?;
                if std::str::from_utf8(body).is_err() {
                    return Err(PayloadError::InvalidText { field });
                }
                4 + len
            }
        };
        let end = self.offset + width;
        let bytes = self.payload.get(self.offset..end).ok_or(truncated)?;
        if kind == FieldKind::Bool && bytes.first().is_some_and(|b| *b > 1) {
            return Err(PayloadError::InvalidBool {
                field,
                value: bytes.first().copied().unwrap_or_default(),
            });
        }
        self.offset = end;
        Ok(kind)
    }
}

fn fixed<const N: usize>(bytes: &[u8], field: usize) -> Result<[u8; N], PayloadError> {
    bytes
        .try_into()
        .map_err(|_| PayloadError::Truncated { field, offset: 0 })
}
