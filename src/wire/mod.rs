//! Binary codec: primitives, strings, references and metas. The frame structure on top of
//!  this lives in [crate::data::context].

pub mod flags;
pub mod message;
pub mod meta;
pub mod reader;
pub mod string_table;
pub mod writer;

/// terminates a raw string, which is a sequence of UTF-16 code units
pub const STRING_TERMINATOR: u16 = 0;
/// terminates a type-ID, which is UTF-8
pub const TYPE_ID_TERMINATOR: u8 = 0;

/// Leading code unit introducing a string table ID (varint) instead of a literal string. As
///  `0xFF` never occurs in UTF-8, its byte form `FF FF` also marks mapped type-IDs.
pub const MAPPED_STRING_MARKER: u16 = 0xFFFF;

/// Leading code units encoding well-known constant strings. They are noncharacters, so a raw
///  string starting with one of them is rejected instead of being written.
pub const WELL_KNOWN_FIRST: u16 = 0xFDD0;
pub const WELL_KNOWN_LAST: u16 = 0xFDD6;
pub const MAX_WELL_KNOWN: usize = (WELL_KNOWN_LAST - WELL_KNOWN_FIRST + 1) as usize;

/// maximum encoded length of a raw string or type-ID in bytes, terminator excluded
pub const MAX_NET_STRING_LEN: usize = 4096;

/// wire ID of an absent optional reference
pub const REF_NONE: u32 = u32::MAX;
