//! Transport core of a multiplayer relay server: a TCP stream plus an optional UDP flow per
//!  client, a binary message codec with references and string tables, and a pool of worker
//!  roles moving bytes between sockets and connections.

pub mod config;
pub mod connection;
pub mod data;
pub mod identity;
pub mod messages;
pub mod pool;
pub mod roles;
pub mod server;
pub mod test_util;
pub mod token;
pub mod util;
pub mod wire;
