use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;

use crate::data::context::DataContext;
use crate::wire::message::{Message, RefIdentity};
use crate::wire::string_table::StringTable;
use crate::wire::{MAPPED_STRING_MARKER, MAX_NET_STRING_LEN, REF_NONE, STRING_TERMINATOR, TYPE_ID_TERMINATOR, WELL_KNOWN_FIRST, WELL_KNOWN_LAST};


/// Serializes primitives, strings and references into a buffer. Message bodies are written
///  through this, the frame structure is the data context's business.
///
/// All fixed-width numbers are little endian.
pub struct DataWriter<'a> {
    buf: &'a mut BytesMut,
    ctx: &'a DataContext,
    strings: Option<&'a StringTable>,
}

impl <'a> DataWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, ctx: &'a DataContext, strings: Option<&'a StringTable>) -> DataWriter<'a> {
        DataWriter { buf, ctx, strings }
    }

    pub fn ctx(&self) -> &'a DataContext {
        self.ctx
    }

    pub fn strings(&self) -> Option<&'a StringTable> {
        self.strings
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }
    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }
    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }
    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_varint_u32(&mut self, v: u32) {
        self.buf.put_u32_varint(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn patch_u8(&mut self, pos: usize, v: u8) {
        self.buf[pos] = v;
    }

    pub fn patch_u16(&mut self, pos: usize, v: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// NUL-terminated UTF-8, used for frame type-IDs
    pub fn write_cstr(&mut self, s: &str) -> anyhow::Result<()> {
        if s.len() > MAX_NET_STRING_LEN {
            bail!("type-ID of {} bytes exceeds the maximum of {}", s.len(), MAX_NET_STRING_LEN);
        }
        if s.as_bytes().contains(&TYPE_ID_TERMINATOR) {
            bail!("type-ID contains a NUL character");
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(TYPE_ID_TERMINATOR);
        Ok(())
    }

    /// A type-ID that is written as a string table ID if the peer announced one for it, and as
    ///  UTF-8 otherwise
    pub fn write_type_id(&mut self, s: &str) -> anyhow::Result<()> {
        if let Some(id) = self.strings.and_then(|t| t.try_map(s)) {
            self.buf.put_u16_le(MAPPED_STRING_MARKER);
            self.buf.put_u32_varint(id);
            return Ok(());
        }
        self.write_cstr(s)
    }

    /// UTF-16 code units (little endian) terminated by a NUL code unit, without control codes
    pub fn write_raw_string(&mut self, s: &str) -> anyhow::Result<()> {
        let mut units = s.encode_utf16().peekable();
        if let Some(&first) = units.peek() {
            if first == MAPPED_STRING_MARKER || (WELL_KNOWN_FIRST..=WELL_KNOWN_LAST).contains(&first) {
                bail!("string starts with the reserved code unit {:#06x}", first);
            }
        }

        let start = self.buf.len();
        for unit in units {
            if unit == STRING_TERMINATOR {
                self.buf.truncate(start);
                bail!("string contains a NUL character");
            }
            self.buf.put_u16_le(unit);
        }
        let len = self.buf.len() - start;
        if len > MAX_NET_STRING_LEN {
            self.buf.truncate(start);
            bail!("string of {} bytes exceeds the maximum of {}", len, MAX_NET_STRING_LEN);
        }
        self.buf.put_u16_le(STRING_TERMINATOR);
        Ok(())
    }

    /// A string that is never mapped through the string table (but may be a well-known constant)
    pub fn write_net_string(&mut self, s: &str) -> anyhow::Result<()> {
        if let Some(code) = self.ctx.well_known_code(s) {
            self.buf.put_u16_le(WELL_KNOWN_FIRST + u16::from(code));
            return Ok(());
        }
        self.write_raw_string(s)
    }

    /// A string that is written as a string table ID if the peer announced one for it, and
    ///  literally otherwise
    pub fn write_mapped_string(&mut self, s: &str) -> anyhow::Result<()> {
        if let Some(code) = self.ctx.well_known_code(s) {
            self.buf.put_u16_le(WELL_KNOWN_FIRST + u16::from(code));
            return Ok(());
        }
        if let Some(id) = self.strings.and_then(|t| t.try_map(s)) {
            self.buf.put_u16_le(MAPPED_STRING_MARKER);
            self.buf.put_u32_varint(id);
            return Ok(());
        }
        self.write_raw_string(s)
    }

    /// writes the ID of a global reference
    pub fn write_ref<T: Message + ?Sized>(&mut self, r: &T) -> anyhow::Result<()> {
        match r.reference() {
            Some(RefIdentity::Global { id, .. }) => {
                if id == REF_NONE {
                    bail!("reference {}#{} uses the reserved 'none' ID", r.data_type(), id);
                }
                self.write_u32(id);
                Ok(())
            }
            _ => bail!("{} is not a global reference", r.data_type()),
        }
    }

    pub fn write_opt_ref<T: Message + ?Sized>(&mut self, r: Option<&T>) -> anyhow::Result<()> {
        match r {
            Some(r) => self.write_ref(r),
            None => {
                self.write_u32(REF_NONE);
                Ok(())
            }
        }
    }
}
