use anyhow::bail;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::flags::DataFlags;
use crate::wire::message::{DataType, Message};
use crate::wire::meta::MetaSet;
use crate::wire::reader::DataReader;
use crate::wire::writer::DataWriter;


/// Announces string table IDs the sender assigned for its read side. Values are always written
///  literally, and a single message stays well below the frame size limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMap {
    pub entries: Vec<(String, u32)>,
}

impl StringMap {
    pub const MAX_ENTRIES: usize = 64;
}

impl Message for StringMap {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        DataFlags::CORE_TYPE | DataFlags::NO_STANDARD_META
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        if self.entries.len() > Self::MAX_ENTRIES {
            bail!("string map with {} entries, maximum is {}", self.entries.len(), Self::MAX_ENTRIES);
        }
        let count: u8 = self.entries.len().prechecked_cast();
        w.write_u8(count);
        for (value, id) in &self.entries {
            w.write_raw_string(value)?;
            w.write_varint_u32(*id);
        }
        Ok(())
    }
}

impl DataType for StringMap {
    const DATA_TYPE: &'static str = "strmap";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        let count: usize = r.read_u8()?.safe_cast();
        if count > Self::MAX_ENTRIES {
            bail!("string map with {} entries, maximum is {}", count, Self::MAX_ENTRIES);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let value = r.read_raw_string()?;
            let id = r.read_varint_u32()?;
            entries.push((value, id));
        }
        Ok(StringMap { entries })
    }
}


/// Sent on a channel that was idle for a while, so the peer's timeout does not kick in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub unreliable: bool,
}

impl Message for KeepAlive {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        let flags = DataFlags::CORE_TYPE | DataFlags::SMALL | DataFlags::NO_STANDARD_META;
        if self.unreliable {
            flags | DataFlags::UNRELIABLE
        }
        else {
            flags
        }
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_bool(self.unreliable);
        Ok(())
    }
}

impl DataType for KeepAlive {
    const DATA_TYPE: &'static str = "keepalive";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(KeepAlive {
            unreliable: r.read_bool()?,
        })
    }
}


/// the last message before a connection is closed on purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub reason: String,
}

impl Message for DisconnectReason {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        DataFlags::CORE_TYPE | DataFlags::NO_STANDARD_META
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_net_string(&self.reason)
    }
}

impl DataType for DisconnectReason {
    const DATA_TYPE: &'static str = "disconnectReason";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(DisconnectReason {
            reason: r.read_net_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::connection::Connection;
    use crate::test_util::connection::TrackingConnection;
    use crate::test_util::message::test_context;
    use crate::wire::message::downcast_ref;
    use super::*;

    #[test]
    fn test_string_map_round_trip() {
        let ctx = test_context();
        let msg = StringMap { entries: vec![("player".to_string(), 0), ("position".to_string(), 300)] };

        let mut buf = BytesMut::new();
        ctx.write_frame(&mut buf, &msg, &[], None).unwrap();
        let frame = ctx.read_frame(&mut DataReader::new(&buf, &ctx, None)).unwrap();
        assert_eq!(downcast_ref::<StringMap>(frame.message.as_ref()), Some(&msg));
    }

    #[test]
    fn test_string_map_size_limit() {
        let ctx = test_context();
        let msg = StringMap { entries: (0..65).map(|i| (format!("s{}", i), i)).collect() };
        assert!(ctx.write_frame(&mut BytesMut::new(), &msg, &[], None).is_err());
    }

    #[test]
    fn test_keepalive_channel() {
        assert!(KeepAlive { unreliable: true }.flags().contains(DataFlags::UNRELIABLE));
        assert!(!KeepAlive { unreliable: false }.flags().contains(DataFlags::UNRELIABLE));
    }

    #[test]
    fn test_kick_sends_reason_first() {
        let tracking = TrackingConnection::new("k");
        tracking.kick("bye");
        assert!(!tracking.is_alive());

        let sent = tracking.take_sent();
        assert_eq!(sent.len(), 1);
        let reason = downcast_ref::<DisconnectReason>(sent[0].message().unwrap().as_ref()).unwrap();
        assert_eq!(reason.reason, "bye");
    }
}
