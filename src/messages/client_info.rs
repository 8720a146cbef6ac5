use anyhow::bail;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::flags::DataFlags;
use crate::wire::message::{DataType, Message};
use crate::wire::meta::MetaSet;
use crate::wire::reader::DataReader;
use crate::wire::writer::DataWriter;


const MAX_ENTRIES: usize = 32;

/// Asks a freshly connected client for information about itself as part of the extended
///  handshake. `checks` names the items the server is interested in; `nonce` must be echoed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfoRequest {
    pub nonce: u32,
    pub checks: Vec<String>,
}

impl Message for ClientInfoRequest {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        DataFlags::CORE_TYPE | DataFlags::NO_STANDARD_META
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        if self.checks.len() > MAX_ENTRIES {
            bail!("too many client info checks: {}", self.checks.len());
        }
        w.write_u32(self.nonce);
        let count: u8 = self.checks.len().prechecked_cast();
        w.write_u8(count);
        for check in &self.checks {
            w.write_net_string(check)?;
        }
        Ok(())
    }
}

impl DataType for ClientInfoRequest {
    const DATA_TYPE: &'static str = "clientInfoReq";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        let nonce = r.read_u32()?;
        let count: usize = r.read_u8()?.safe_cast();
        if count > MAX_ENTRIES {
            bail!("too many client info checks: {}", count);
        }
        let checks = (0..count)
            .map(|_| r.read_net_string())
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ClientInfoRequest { nonce, checks })
    }
}


/// the client's reply to a [ClientInfoRequest]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub nonce: u32,
    pub entries: Vec<(String, String)>,
}

impl ClientInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Message for ClientInfo {
    fn data_type(&self) -> &str {
        Self::DATA_TYPE
    }

    fn flags(&self) -> DataFlags {
        DataFlags::CORE_TYPE | DataFlags::NO_STANDARD_META
    }

    fn write(&self, w: &mut DataWriter<'_>) -> anyhow::Result<()> {
        if self.entries.len() > MAX_ENTRIES {
            bail!("too many client info entries: {}", self.entries.len());
        }
        w.write_u32(self.nonce);
        let count: u8 = self.entries.len().prechecked_cast();
        w.write_u8(count);
        for (key, value) in &self.entries {
            w.write_net_string(key)?;
            w.write_net_string(value)?;
        }
        Ok(())
    }
}

impl DataType for ClientInfo {
    const DATA_TYPE: &'static str = "clientInfo";

    fn read(r: &mut DataReader<'_>, _metas: &MetaSet) -> anyhow::Result<Self> {
        let nonce = r.read_u32()?;
        let count: usize = r.read_u8()?.safe_cast();
        if count > MAX_ENTRIES {
            bail!("too many client info entries: {}", count);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = r.read_net_string()?;
            let value = r.read_net_string()?;
            entries.push((key, value));
        }
        Ok(ClientInfo { nonce, entries })
    }
}
