use std::mem::size_of;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Buf;
use bytes_varint::VarIntSupport;

use crate::data::context::DataContext;
use crate::wire::message::DataType;
use crate::wire::string_table::StringTable;
use crate::wire::{MAPPED_STRING_MARKER, MAX_NET_STRING_LEN, REF_NONE, STRING_TERMINATOR, TYPE_ID_TERMINATOR, WELL_KNOWN_FIRST, WELL_KNOWN_LAST};


macro_rules! read_fixed {
    ($name: ident, $ty:ty, $getter: ident) => {
        pub fn $name(&mut self) -> anyhow::Result<$ty> {
            if self.buf.remaining() < size_of::<$ty>() {
                bail!("buffer underflow reading {}", stringify!($ty));
            }
            Ok(self.buf.$getter())
        }
    }
}


/// Counterpart of [crate::wire::writer::DataWriter]: reads primitives, strings and references
///  from a byte slice. Reading past the end is an error, never a panic.
pub struct DataReader<'a> {
    buf: &'a [u8],
    ctx: &'a DataContext,
    strings: Option<&'a StringTable>,
}

impl <'a> DataReader<'a> {
    pub fn new(buf: &'a [u8], ctx: &'a DataContext, strings: Option<&'a StringTable>) -> DataReader<'a> {
        DataReader { buf, ctx, strings }
    }

    pub fn ctx(&self) -> &'a DataContext {
        self.ctx
    }

    pub fn strings(&self) -> Option<&'a StringTable> {
        self.strings
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// the unread part of the buffer
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    read_fixed!(read_u8, u8, get_u8);
    read_fixed!(read_u16, u16, get_u16_le);
    read_fixed!(read_u32, u32, get_u32_le);
    read_fixed!(read_u64, u64, get_u64_le);
    read_fixed!(read_i32, i32, get_i32_le);
    read_fixed!(read_i64, i64, get_i64_le);
    read_fixed!(read_f32, f32, get_f32_le);

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn peek_u8(&self) -> anyhow::Result<u8> {
        self.buf.first()
            .copied()
            .ok_or_else(|| anyhow!("buffer underflow peeking u8"))
    }

    pub fn peek_u16(&self) -> anyhow::Result<u16> {
        match self.buf {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => bail!("buffer underflow peeking u16"),
        }
    }

    pub fn read_varint_u32(&mut self) -> anyhow::Result<u32> {
        self.buf.try_get_u32_varint()
            .map_err(|e| anyhow!("invalid varint: {:?}", e))
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() < len {
            bail!("buffer underflow reading {} bytes, {} remaining", len, self.buf.len());
        }
        let (result, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(result)
    }

    /// Splits off the next `len` bytes into a reader of their own, sharing context and string
    ///  table
    pub fn sub_reader(&mut self, len: usize) -> anyhow::Result<DataReader<'a>> {
        let buf = self.read_bytes(len)?;
        Ok(DataReader {
            buf,
            ctx: self.ctx,
            strings: self.strings,
        })
    }

    /// NUL-terminated UTF-8, used for frame type-IDs
    pub fn read_cstr(&mut self) -> anyhow::Result<String> {
        let max_scan = self.buf.len().min(MAX_NET_STRING_LEN + 1);
        let Some(len) = self.buf[..max_scan].iter().position(|&b| b == TYPE_ID_TERMINATOR) else {
            if self.buf.len() > MAX_NET_STRING_LEN {
                bail!("type-ID exceeds the maximum length of {} bytes", MAX_NET_STRING_LEN);
            }
            bail!("unterminated type-ID");
        };

        let raw = self.read_bytes(len)?;
        self.buf.advance(1);
        Ok(std::str::from_utf8(raw)?.to_string())
    }

    /// Reads a type-ID that may be a string table ID. Literal type-IDs are counted on the
    ///  string table so that frequent ones get promoted.
    pub fn read_type_id(&mut self) -> anyhow::Result<String> {
        if self.peek_u16().ok() == Some(MAPPED_STRING_MARKER) {
            return self.read_mapped_id();
        }
        let s = self.read_cstr()?;
        if let Some(strings) = self.strings {
            strings.count_read(&s);
        }
        Ok(s)
    }

    /// NUL-terminated UTF-16 code units (little endian), without control codes. Unpaired
    ///  surrogates are an error.
    pub fn read_raw_string(&mut self) -> anyhow::Result<String> {
        let mut units = Vec::new();
        let mut pos = 0;
        loop {
            let Some(pair) = self.buf.get(pos..pos + 2) else {
                if self.buf.len() > MAX_NET_STRING_LEN {
                    bail!("string exceeds the maximum length of {} bytes", MAX_NET_STRING_LEN);
                }
                bail!("unterminated string");
            };
            pos += 2;
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == STRING_TERMINATOR {
                break;
            }
            if pos > MAX_NET_STRING_LEN {
                bail!("string exceeds the maximum length of {} bytes", MAX_NET_STRING_LEN);
            }
            units.push(unit);
        }
        self.buf.advance(pos);

        char::decode_utf16(units)
            .collect::<Result<String, _>>()
            .map_err(|e| anyhow!("invalid string: {}", e))
    }

    pub fn read_net_string(&mut self) -> anyhow::Result<String> {
        let (s, _) = self.read_net_string_inner()?;
        Ok(s)
    }

    /// Reads a string that may be a string table ID. Literal strings are counted on the
    ///  string table so that frequent ones get promoted.
    pub fn read_mapped_string(&mut self) -> anyhow::Result<String> {
        if self.peek_u16()? == MAPPED_STRING_MARKER {
            return self.read_mapped_id();
        }

        let (s, is_literal) = self.read_net_string_inner()?;
        if is_literal {
            if let Some(strings) = self.strings {
                strings.count_read(&s);
            }
        }
        Ok(s)
    }

    fn read_mapped_id(&mut self) -> anyhow::Result<String> {
        self.buf.advance(2);
        let id = self.read_varint_u32()?;
        let Some(strings) = self.strings else {
            bail!("mapped string #{} on a connection without string table", id);
        };
        strings.get_read(id)
            .ok_or_else(|| anyhow!("unknown string table ID {}", id))
    }

    fn read_net_string_inner(&mut self) -> anyhow::Result<(String, bool)> {
        match self.peek_u16()? {
            MAPPED_STRING_MARKER => bail!("mapped string where a literal string was expected"),
            code @ WELL_KNOWN_FIRST..=WELL_KNOWN_LAST => {
                self.buf.advance(2);
                let code = u8::try_from(code - WELL_KNOWN_FIRST)?;
                let s = self.ctx.well_known_string(code)
                    .ok_or_else(|| anyhow!("unassigned string control code {:#06x}", WELL_KNOWN_FIRST + u16::from(code)))?;
                Ok((s.to_string(), false))
            }
            _ => Ok((self.read_raw_string()?, true)),
        }
    }

    /// Reads a required reference - a reference that is not (or no longer) known is an error
    pub fn read_ref<T: DataType>(&mut self) -> anyhow::Result<Arc<T>> {
        let id = self.read_u32()?;
        self.ctx.refs().get_ref::<T>(id)
            .ok_or_else(|| anyhow!("unknown required reference {}#{}", T::DATA_TYPE, id))
    }

    /// Reads an optional reference, resolving to `None` if it is not known
    pub fn read_opt_ref<T: DataType>(&mut self) -> anyhow::Result<Option<Arc<T>>> {
        let id = self.read_u32()?;
        if id == REF_NONE {
            return Ok(None);
        }
        Ok(self.ctx.refs().get_ref::<T>(id))
    }
}
