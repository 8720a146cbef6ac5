use anyhow::bail;
use bytes::Bytes;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::reader::DataReader;
use crate::wire::writer::DataWriter;


/// Side-channel records carried in front of a message body. They are generated before writing
///  and handed to the variant when reading, so derived fields (like a reference's own ID) need
///  not be part of the body.
///
/// Wire format per item: `[meta type: mapped string][length: u8][body]`. Items of unknown type
///  are kept verbatim as [MetaItem::Unparsed].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaItem {
    /// the message is the latest state of the reference with this ID
    Ref { id: u32 },
    /// the message is bound to the reference `owner_type`#`owner_id`
    BoundRef { owner_type: String, owner_id: u32 },
    /// the sender expects a reply carrying a [MetaItem::Response] with the same ID
    Request { id: u32 },
    /// the message is the reply to the request with this ID
    Response { id: u32 },
    /// position in the ordered update stream for one entity - stale updates are dropped
    OrderedUpdate { entity_id: u32, seq: u8 },
    Unparsed { meta_type: String, data: Bytes },
}

impl MetaItem {
    pub const REF: &'static str = "ref";
    pub const BOUND_REF: &'static str = "boundRef";
    pub const REQUEST: &'static str = "req";
    pub const RESPONSE: &'static str = "res";
    pub const ORDERED_UPDATE: &'static str = "order";

    pub fn meta_type(&self) -> &str {
        match self {
            MetaItem::Ref { .. } => Self::REF,
            MetaItem::BoundRef { .. } => Self::BOUND_REF,
            MetaItem::Request { .. } => Self::REQUEST,
            MetaItem::Response { .. } => Self::RESPONSE,
            MetaItem::OrderedUpdate { .. } => Self::ORDERED_UPDATE,
            MetaItem::Unparsed { meta_type, .. } => meta_type,
        }
    }

    pub fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_mapped_string(self.meta_type())?;

        let len_pos = w.position();
        w.write_u8(0);
        let body_start = w.position();

        match self {
            MetaItem::Ref { id } => w.write_u32(*id),
            MetaItem::BoundRef { owner_type, owner_id } => {
                w.write_mapped_string(owner_type)?;
                w.write_u32(*owner_id);
            }
            MetaItem::Request { id } => w.write_u32(*id),
            MetaItem::Response { id } => w.write_u32(*id),
            MetaItem::OrderedUpdate { entity_id, seq } => {
                w.write_u32(*entity_id);
                w.write_u8(*seq);
            }
            MetaItem::Unparsed { data, .. } => w.write_bytes(data),
        }

        let body_len = w.position() - body_start;
        if body_len > u8::MAX as usize {
            bail!("meta {} has a body of {} bytes, exceeding the maximum of 255", self.meta_type(), body_len);
        }
        w.patch_u8(len_pos, body_len.prechecked_cast());
        Ok(())
    }

    pub fn read(r: &mut DataReader<'_>) -> anyhow::Result<MetaItem> {
        let meta_type = r.read_mapped_string()?;
        let len: usize = r.read_u8()?.safe_cast();
        let mut body = r.sub_reader(len)?;

        let result = match meta_type.as_str() {
            Self::REF => MetaItem::Ref { id: body.read_u32()? },
            Self::BOUND_REF => MetaItem::BoundRef {
                owner_type: body.read_mapped_string()?,
                owner_id: body.read_u32()?,
            },
            Self::REQUEST => MetaItem::Request { id: body.read_u32()? },
            Self::RESPONSE => MetaItem::Response { id: body.read_u32()? },
            Self::ORDERED_UPDATE => MetaItem::OrderedUpdate {
                entity_id: body.read_u32()?,
                seq: body.read_u8()?,
            },
            _ => {
                let data = Bytes::copy_from_slice(body.read_bytes(len)?);
                MetaItem::Unparsed { meta_type, data }
            }
        };
        Ok(result)
    }
}


/// The metas of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSet(pub Vec<MetaItem>);

impl MetaSet {
    pub fn new() -> MetaSet {
        MetaSet(Vec::new())
    }

    pub fn push(&mut self, item: MetaItem) {
        self.0.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaItem> {
        self.0.iter()
    }

    pub fn ref_id(&self) -> Option<u32> {
        self.0.iter().find_map(|m| match m {
            MetaItem::Ref { id } => Some(*id),
            _ => None,
        })
    }

    pub fn bound_ref(&self) -> Option<(&str, u32)> {
        self.0.iter().find_map(|m| match m {
            MetaItem::BoundRef { owner_type, owner_id } => Some((owner_type.as_str(), *owner_id)),
            _ => None,
        })
    }

    pub fn request_id(&self) -> Option<u32> {
        self.0.iter().find_map(|m| match m {
            MetaItem::Request { id } => Some(*id),
            _ => None,
        })
    }

    pub fn response_id(&self) -> Option<u32> {
        self.0.iter().find_map(|m| match m {
            MetaItem::Response { id } => Some(*id),
            _ => None,
        })
    }

    pub fn ordered_update(&self) -> Option<(u32, u8)> {
        self.0.iter().find_map(|m| match m {
            MetaItem::OrderedUpdate { entity_id, seq } => Some((*entity_id, *seq)),
            _ => None,
        })
    }

    pub fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        if self.0.len() > u8::MAX as usize {
            bail!("too many metas: {}", self.0.len());
        }
        w.write_u8(self.0.len().prechecked_cast());
        for item in &self.0 {
            item.write(w)?;
        }
        Ok(())
    }

    pub fn read(r: &mut DataReader<'_>) -> anyhow::Result<MetaSet> {
        let count = r.read_u8()?;
        let mut items = Vec::with_capacity(count.safe_cast());
        for _ in 0..count {
            items.push(MetaItem::read(r)?);
        }
        Ok(MetaSet(items))
    }
}

impl From<Vec<MetaItem>> for MetaSet {
    fn from(value: Vec<MetaItem>) -> Self {
        MetaSet(value)
    }
}
