//! The server's thread pool roles. Each role owns one concern of moving bytes between sockets
//!  and connections:
//!
//! * `acceptor` accepts TCP connections and hands them to the `handshaker`
//! * `handshaker` runs the teapot handshake and creates sessions
//! * `tcp-receiver` / `udp-receiver` read from sockets and dispatch frames
//! * `tcp-sender` / `udp-sender` drain connections' send queues
//! * `heartbeat` sends keep-alives and enforces timeouts

pub mod acceptor;
pub mod binder;
pub mod handshaker;
pub mod heartbeat;
pub mod poller;
pub mod receiver;
pub mod sender;
pub mod teapot;

use std::io::{self, ErrorKind};

use tracing::{debug, warn};

use crate::connection::Connection;


/// Socket errors that mean the peer went away, as opposed to a fault on our side
pub fn is_peer_closed(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<io::Error>() {
        Some(e) => matches!(e.kind(),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
        ),
        None => false,
    }
}

/// Disposes a connection after an I/O failure, logging at a severity matching the cause
pub fn dispose_after_error(conn: &dyn Connection, context: &str, e: &anyhow::Error) {
    if is_peer_closed(e) {
        debug!(uid = conn.uid(), "{}: peer closed the connection ({})", context, e);
    }
    else {
        warn!(uid = conn.uid(), "{}: {:#}", context, e);
    }
    conn.dispose();
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::reset(io::Error::from(ErrorKind::ConnectionReset).into(), true)]
    #[case::broken_pipe(io::Error::from(ErrorKind::BrokenPipe).into(), true)]
    #[case::other_io(io::Error::from(ErrorKind::PermissionDenied).into(), false)]
    #[case::protocol(anyhow!("malformed frame"), false)]
    fn test_is_peer_closed(#[case] e: anyhow::Error, #[case] expected: bool) {
        assert_eq!(is_peer_closed(&e), expected);
    }
}
