//! Message variants owned by the transport core. Applications register their own variants on
//!  top of these.

mod client_info;
mod low_level;

use std::sync::Arc;

use tracing::{debug, info, trace};

pub use client_info::{ClientInfo, ClientInfoRequest};
pub use low_level::{DisconnectReason, KeepAlive, StringMap};

use crate::connection::Connection;
use crate::data::context::{DataContext, ReadFn};
use crate::wire::meta::MetaSet;


pub(crate) fn core_types() -> Vec<(&'static str, ReadFn)> {
    vec![
        DataContext::core_type::<StringMap>(),
        DataContext::core_type::<KeepAlive>(),
        DataContext::core_type::<DisconnectReason>(),
        DataContext::core_type::<ClientInfoRequest>(),
        DataContext::core_type::<ClientInfo>(),
    ]
}

pub(crate) fn register_core_handlers(ctx: &DataContext) {
    ctx.register_handler::<StringMap>(on_string_map);
    ctx.register_handler::<KeepAlive>(|conn, _, _| {
        trace!(uid = conn.uid(), "keep-alive");
        Ok(())
    });
    ctx.register_handler::<DisconnectReason>(|conn, msg, _| {
        info!(uid = conn.uid(), "peer is disconnecting: {}", msg.reason);
        Ok(())
    });
}

/// The peer announces strings it will resolve by ID, so we may write them as IDs from now on
fn on_string_map(conn: &Arc<dyn Connection>, msg: &StringMap, _metas: &MetaSet) -> anyhow::Result<()> {
    let Some(strings) = conn.strings() else {
        debug!(uid = conn.uid(), "ignoring string map on a connection without string table");
        return Ok(());
    };
    for (value, id) in &msg.entries {
        strings.register_write(value.clone(), *id);
    }
    Ok(())
}
