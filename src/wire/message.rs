use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::wire::flags::DataFlags;
use crate::wire::meta::{MetaItem, MetaSet};
use crate::wire::reader::DataReader;
use crate::wire::writer::DataWriter;


/// Upcasting helper so that type-erased messages can be downcast to their concrete variant.
///
/// NB: This is implemented for *every* `Any + Send + Sync` type, including `Arc<dyn Message>`
///      itself - call it on the dereferenced message (`msg.as_ref().as_any()`), not on the
///      smart pointer.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
impl <T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}


/// Identity of a message that is a *reference*, i.e. the latest known state of a long-lived
///  entity that other messages can point to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefIdentity {
    /// addressed by its own ID
    Global { id: u32, alive: bool },
    /// addressed by the reference it is bound to; there is at most one bound reference per
    ///  bound type and owner
    Bound { owner_type: &'static str, owner_id: u32, alive: bool },
}

impl RefIdentity {
    pub fn is_alive(&self) -> bool {
        match self {
            RefIdentity::Global { alive, .. } => *alive,
            RefIdentity::Bound { alive, .. } => *alive,
        }
    }
}


/// A polymorphic unit of wire data. Concrete variants additionally implement [DataType], which
///  is what gets registered with the data context.
pub trait Message: AsAny + Debug {
    /// the variant's wire type-ID, unique process-wide
    fn data_type(&self) -> &str;

    fn flags(&self) -> DataFlags {
        DataFlags::empty()
    }

    /// `Some` if this message is a (global or bound) reference
    fn reference(&self) -> Option<RefIdentity> {
        None
    }

    /// `Some(entity)` if the message is an update in an ordered per-entity stream: the sending
    ///  connection tags it with a sequence number, and receivers drop stale updates
    fn ordered_entity(&self) -> Option<u32> {
        None
    }

    /// variant specific metas, in addition to the standard metas generated by the data context
    fn metas(&self) -> Vec<MetaItem> {
        Vec::new()
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()>;
}

/// The statically known part of a message variant: its type-ID and how to read it.
pub trait DataType: Message + Sized {
    const DATA_TYPE: &'static str;

    /// Reads the message body. `metas` were read before the body and allow rehydrating fields
    ///  that are not part of the body (e.g. the reference ID).
    fn read(r: &mut DataReader<'_>, metas: &MetaSet) -> anyhow::Result<Self>;
}

pub fn downcast_ref<T: Message>(msg: &dyn Message) -> Option<&T> {
    msg.as_any().downcast_ref::<T>()
}

pub fn downcast_arc<T: Message>(msg: Arc<dyn Message>) -> Option<Arc<T>> {
    msg.into_any_arc().downcast::<T>().ok()
}


/// A message with a type-ID that is not registered. It carries the header fields, the metas and
///  the body verbatim, so it can be relayed or logged without being understood.
///
/// Metas are decoded rather than kept as raw bytes because they may contain string table IDs,
///  which are only meaningful on the connection they were received on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparsedMessage {
    pub data_type: String,
    pub flags: DataFlags,
    pub metas: Vec<MetaItem>,
    pub body: Bytes,
}

impl Message for UnparsedMessage {
    fn data_type(&self) -> &str {
        &self.data_type
    }

    fn flags(&self) -> DataFlags {
        self.flags
    }

    fn metas(&self) -> Vec<MetaItem> {
        self.metas.clone()
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_bytes(&self.body);
        Ok(())
    }
}
