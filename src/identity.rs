use std::net::IpAddr;
use std::time::SystemTime;

#[cfg(test)] use mockall::automock;
use sha2::{Digest, Sha256};


/// The persisted side of player identities: name keys and bans. The relay core only reads
///  from it, during the handshake.
#[cfg_attr(test, automock)]
pub trait IdentityStore: Send + Sync + 'static {
    /// Resolves a name key (without the leading marker) to a stable identity. An error means
    ///  the store is unavailable, not that the key is unknown.
    fn resolve_key(&self, key: &str) -> anyhow::Result<Option<Identity>>;

    /// the ban record for a UID, if there is one - active or not
    fn ban(&self, uid: &str) -> anyhow::Result<Option<BanRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub reason: String,
    /// `None` means the ban has always been in effect
    pub start: Option<SystemTime>,
    /// `None` means the ban never expires
    pub end: Option<SystemTime>,
}

impl BanRecord {
    pub fn is_active_at(&self, now: SystemTime) -> bool {
        self.start.map_or(true, |start| start <= now)
            && self.end.map_or(true, |end| now <= end)
    }
}


/// A store without keys or bans, for servers that only allow anonymous play
#[derive(Debug, Default)]
pub struct NullIdentityStore;

impl IdentityStore for NullIdentityStore {
    fn resolve_key(&self, _key: &str) -> anyhow::Result<Option<Identity>> {
        Ok(None)
    }

    fn ban(&self, _uid: &str) -> anyhow::Result<Option<BanRecord>> {
        Ok(None)
    }
}


pub const NAME_KEY_MARKER: char = '#';
pub const DEFAULT_NAME: &str = "Guest";

/// characters with special meaning in names, UIDs or chat commands
const ILLEGAL_NAME_CHARS: &[char] = &['#', '|', ':', '\\', '/', '"', '<', '>'];

/// Strips illegal characters, clamps to `max_len` characters and falls back to
///  [DEFAULT_NAME] if nothing remains
pub fn sanitize_name(name: &str, max_len: usize) -> String {
    let cleaned: String = name.chars()
        .filter(|c| !c.is_control() && !ILLEGAL_NAME_CHARS.contains(c))
        .collect();
    let clamped: String = cleaned.trim().chars().take(max_len).collect();
    let clamped = clamped.trim_end();
    if clamped.is_empty() {
        DEFAULT_NAME.to_string()
    }
    else {
        clamped.to_string()
    }
}

/// The ephemeral UID of an anonymous player, derived from where they connect from. The address
///  itself does not leak into logs or ban lists.
pub fn origin_uid(ip: IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    let hex: String = digest.iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("con|{}", hex)
}
