//! WBXML (WAP Binary XML) encoding and decoding, restricted to the subset
//! Exchange ActiveSync uses: inline UTF-8 strings, opaque byte blocks, and
//! codepage-switched element tokens. Attributes, entities, and string tables
//! never appear on the wire and are not supported.

mod parser;
mod serializer;

pub use self::parser::{Parser, Token};
pub use self::serializer::{write_integer, Serializer};

/// Control bytes of the WBXML token stream.
pub(crate) mod control {
    pub const SWITCH_PAGE: u8 = 0x00;
    pub const END: u8 = 0x01;
    pub const STR_I: u8 = 0x03;
    pub const OPAQUE: u8 = 0xc3;
    /// Bit set on a tag token whose element has content.
    pub const WITH_CONTENT: u8 = 0x40;
}

/// Document header values: WBXML 1.3, unknown public identifier, UTF-8,
/// empty string table.
pub(crate) mod header {
    pub const VERSION_1_3: u8 = 0x03;
    pub const PUBLIC_ID_UNKNOWN: u8 = 0x01;
    pub const CHARSET_UTF8: u8 = 106;
    pub const EMPTY_STRING_TABLE: u8 = 0x00;
}
