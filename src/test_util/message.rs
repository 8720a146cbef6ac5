use std::sync::Arc;

use anyhow::anyhow;

use crate::data::context::DataContext;
use crate::wire::flags::DataFlags;
use crate::wire::message::{DataType, Message, RefIdentity};
use crate::wire::meta::MetaSet;
use crate::wire::reader::DataReader;
use crate::wire::writer::DataWriter;


/// a context with all test variants registered
pub fn test_context() -> DataContext {
    DataContext::builder()
        .register::<TestPlayer>()
        .register::<TestAvatar>()
        .register::<TestChat>()
        .register::<TestEmote>()
        .register::<TestPosition>()
        .well_known_strings(&[""])
        .build()
        .expect("test variants are registered once")
}


/// A global reference. Its ID travels in the `ref` meta, not in the body.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlayer {
    pub id: u32,
    pub name: String,
    pub alive: bool,
}

impl Message for TestPlayer {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn reference(&self) -> Option<RefIdentity> {
        Some(RefIdentity::Global { id: self.id, alive: self.alive })
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_net_string(&self.name)?;
        w.write_bool(self.alive);
        Ok(())
    }
}

impl DataType for TestPlayer {
    const DATA_TYPE: &'static str = "testPlayer";

    fn read(r: &mut DataReader<'_>, metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(TestPlayer {
            id: metas.ref_id().ok_or_else(|| anyhow!("missing ref meta"))?,
            name: r.read_net_string()?,
            alive: r.read_bool()?,
        })
    }
}


/// bound to a [TestPlayer]
#[derive(Debug, Clone, PartialEq)]
pub struct TestAvatar {
    pub owner: u32,
    pub skin: String,
    pub alive: bool,
}

impl Message for TestAvatar {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn reference(&self) -> Option<RefIdentity> {
        Some(RefIdentity::Bound { owner_type: TestPlayer::DATA_TYPE, owner_id: self.owner, alive: self.alive })
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_mapped_string(&self.skin)?;
        w.write_bool(self.alive);
        Ok(())
    }
}

impl DataType for TestAvatar {
    const DATA_TYPE: &'static str = "testAvatar";

    fn read(r: &mut DataReader<'_>, metas: &MetaSet) -> anyhow::Result<Self> {
        let (owner_type, owner) = metas.bound_ref().ok_or_else(|| anyhow!("missing boundRef meta"))?;
        if owner_type != TestPlayer::DATA_TYPE {
            return Err(anyhow!("avatar bound to a {}", owner_type));
        }
        Ok(TestAvatar {
            owner,
            skin: r.read_mapped_string()?,
            alive: r.read_bool()?,
        })
    }
}


/// refers to a player optionally
#[derive(Debug, Clone, PartialEq)]
pub struct TestChat {
    pub from: Option<Arc<TestPlayer>>,
    pub text: String,
}

impl Message for TestChat {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_opt_ref(self.from.as_deref())?;
        w.write_net_string(&self.text)
    }
}

impl DataType for TestChat {
    const DATA_TYPE: &'static str = "testChat";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(TestChat {
            from: r.read_opt_ref::<TestPlayer>()?,
            text: r.read_net_string()?,
        })
    }
}


/// refers to a player that must be known to the receiver
#[derive(Debug, Clone, PartialEq)]
pub struct TestEmote {
    pub player: Arc<TestPlayer>,
    pub text: String,
}

impl Message for TestEmote {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_ref(self.player.as_ref())?;
        w.write_net_string(&self.text)
    }
}

impl DataType for TestEmote {
    const DATA_TYPE: &'static str = "testEmote";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(TestEmote {
            player: r.read_ref::<TestPlayer>()?,
            text: r.read_net_string()?,
        })
    }
}


/// small, frequent and unreliable - an ordered update per player
#[derive(Debug, Clone, PartialEq)]
pub struct TestPosition {
    pub player_id: u32,
    pub x: f32,
    pub y: f32,
}

impl Message for TestPosition {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        DataFlags::UNRELIABLE | DataFlags::SMALL | DataFlags::SLIM_HEADER
    }

    fn ordered_entity(&self) -> Option<u32> {
        Some(self.player_id)
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        w.write_u32(self.player_id);
        w.write_f32(self.x);
        w.write_f32(self.y);
        Ok(())
    }
}

impl DataType for TestPosition {
    const DATA_TYPE: &'static str = "testPosition";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        Ok(TestPosition {
            player_id: r.read_u32()?,
            x: r.read_f32()?,
            y: r.read_f32()?,
        })
    }
}
