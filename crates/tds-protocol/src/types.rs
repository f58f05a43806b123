//! TDS data type codes and their length conventions.
//!
//! A column value on the wire is preceded by a length prefix whose width is a
//! property of the column's type code (and, for the 2-byte group, of the
//! declared maximum length). [`LengthKind`] captures that convention so the
//! row reader can skip a column without knowing how to interpret it.

use bitflags::bitflags;

use crate::error::ProtocolError;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata and parameter definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types (no length prefix)
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Byte-length types
    /// GUID.
    Guid = 0x24,
    /// Nullable integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Decimal.
    DecimalN = 0x6A,
    /// Numeric.
    NumericN = 0x6C,
    /// Nullable float.
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// Legacy fixed-length character.
    Char = 0x2F,
    /// Legacy variable-length character.
    VarChar = 0x27,
    /// Legacy fixed-length binary.
    Binary = 0x2D,
    /// Legacy variable-length binary.
    VarBinary = 0x25,
    /// Date.
    Date = 0x28,
    /// Time with variable scale.
    Time = 0x29,
    /// DateTime2 with variable scale.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable scale.
    DateTimeOffset = 0x2B,

    // Unsigned-short length types
    /// Variable-length character.
    BigVarChar = 0xA7,
    /// Variable-length binary.
    BigVarBinary = 0xA5,
    /// Fixed-length character.
    BigChar = 0xAF,
    /// Fixed-length binary.
    BigBinary = 0xAD,
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,
    /// CLR user-defined type.
    Udt = 0xF0,

    // Long length types
    /// Text (text pointer + 4-byte length).
    Text = 0x23,
    /// Image (text pointer + 4-byte length).
    Image = 0x22,
    /// NText (text pointer + 4-byte length).
    NText = 0x63,
    /// SQL variant (4-byte length).
    Variant = 0x62,

    // Always partially length-prefixed
    /// XML.
    Xml = 0xF1,

    /// Table-valued parameter (client to server only).
    Tvp = 0xF3,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x37 => Self::Decimal,
            0x3F => Self::Numeric,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x2F => Self::Char,
            0x27 => Self::VarChar,
            0x2D => Self::Binary,
            0x25 => Self::VarBinary,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            0xA7 => Self::BigVarChar,
            0xA5 => Self::BigVarBinary,
            0xAF => Self::BigChar,
            0xAD => Self::BigBinary,
            0xEF => Self::NChar,
            0xE7 => Self::NVarChar,
            0xF0 => Self::Udt,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x62 => Self::Variant,
            0xF1 => Self::Xml,
            0xF3 => Self::Tvp,
            _ => return None,
        })
    }

    /// Resolve a raw type byte, rejecting codes that cannot appear in a
    /// response column descriptor.
    pub fn for_column(value: u8) -> Result<Self, ProtocolError> {
        match Self::from_u8(value) {
            Some(Self::Tvp) | None => Err(ProtocolError::UnsupportedType(value)),
            Some(type_id) => Ok(type_id),
        }
    }

    /// Length-prefix convention for values of this type.
    ///
    /// For the unsigned-short group this is the non-`(max)` form;
    /// [`LengthKind::resolve`] switches to [`LengthKind::Plp`] when the
    /// declared maximum length is `0xFFFF`.
    pub const fn length_kind(self) -> Result<LengthKind, ProtocolError> {
        Ok(match self {
            Self::Null => LengthKind::Fixed(0),
            Self::Int1 | Self::Bit => LengthKind::Fixed(1),
            Self::Int2 => LengthKind::Fixed(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => LengthKind::Fixed(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => LengthKind::Fixed(8),

            Self::Guid
            | Self::IntN
            | Self::Decimal
            | Self::Numeric
            | Self::BitN
            | Self::DecimalN
            | Self::NumericN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary
            | Self::Date
            | Self::Time
            | Self::DateTime2
            | Self::DateTimeOffset => LengthKind::Byte,

            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar
            | Self::Udt => LengthKind::UShort,

            Self::Text | Self::Image | Self::NText => LengthKind::Long { text_pointer: true },
            Self::Variant => LengthKind::Long {
                text_pointer: false,
            },

            Self::Xml => LengthKind::Plp,

            Self::Tvp => return Err(ProtocolError::UnsupportedType(self as u8)),
        })
    }

    /// Check if this is a fixed-length type.
    #[must_use]
    pub fn is_fixed_length(&self) -> bool {
        matches!(self.length_kind(), Ok(LengthKind::Fixed(_)))
    }

    /// Check if this is a Unicode type.
    #[must_use]
    pub const fn is_unicode(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }
}

/// How the length of a column value is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthKind {
    /// No prefix; the value is always this many bytes.
    Fixed(u8),
    /// 1-byte length; `0` is NULL for the nullable fixed types.
    Byte,
    /// 2-byte length; `0xFFFF` is NULL.
    UShort,
    /// 4-byte length, optionally preceded by a text pointer and timestamp.
    Long {
        /// Value starts with a 1-byte text pointer length (0 = NULL), the
        /// pointer, and an 8-byte timestamp.
        text_pointer: bool,
    },
    /// 8-byte total length (`u64::MAX` = NULL) followed by 4-byte-prefixed
    /// chunks terminated by a zero-length chunk.
    Plp,
}

impl LengthKind {
    /// Declared maximum length that marks a `(max)` column.
    pub const MAX_MARKER: u32 = 0xFFFF;

    /// Adjust the base kind for a column's declared maximum length.
    #[must_use]
    pub const fn resolve(self, max_length: Option<u32>) -> Self {
        match (self, max_length) {
            (Self::UShort, Some(Self::MAX_MARKER)) => Self::Plp,
            (kind, _) => kind,
        }
    }
}

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Column is case-sensitive.
        const CASE_SENSITIVE = 0x0002;
        /// Column is updateable (read/write).
        const UPDATEABLE = 0x0004;
        /// Updateability is unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Column is an identity column.
        const IDENTITY = 0x0010;
        /// Column is computed.
        const COMPUTED = 0x0020;
        /// Column has a fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Column is a sparse column set.
        const SPARSE_COLUMN_SET = 0x0200;
        /// Column is encrypted.
        const ENCRYPTED = 0x0400;
        /// Column is hidden.
        const HIDDEN = 0x2000;
        /// Column is part of a key.
        const KEY = 0x4000;
        /// Nullability is unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}
