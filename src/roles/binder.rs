use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace};

use crate::config::ThreadRange;
use crate::util::cancel::CancelToken;


/// With port reuse, every worker of a binder role opens a socket of its own on the same address,
///  and the kernel balances connections / datagrams between them.
pub fn reuse_port_supported() -> bool {
    cfg!(target_os = "linux")
}

/// A binder role can only use more than one thread if each thread can have its own socket
pub fn effective_threads(range: ThreadRange) -> ThreadRange {
    if reuse_port_supported() {
        range
    }
    else {
        ThreadRange::fixed(1)
    }
}

pub trait BindableSocket: Sized + Send + Sync + 'static {
    fn bind_with(addr: SocketAddr, reuse_port: bool) -> io::Result<Self>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Makes a blocking call on the socket return. The socket is unusable afterwards.
    fn interrupt(&self, wake_addr: SocketAddr);
}

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol, reuse_port: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(reuse_port)?;
    #[cfg(not(target_os = "linux"))]
    let _ = reuse_port;
    socket.bind(&addr.into())?;
    Ok(socket)
}

impl BindableSocket for TcpListener {
    fn bind_with(addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        let socket = new_socket(addr, Type::STREAM, Protocol::TCP, reuse_port)?;
        socket.listen(1024)?;
        Ok(socket.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    fn interrupt(&self, wake_addr: SocketAddr) {
        // On Linux, shutting down a listening socket fails a blocked accept(). Elsewhere, a
        //  connection has to arrive to wake it up.
        if let Err(e) = SockRef::from(self).shutdown(Shutdown::Both) {
            trace!("shutting down listener: {}", e);
        }
        if !cfg!(target_os = "linux") {
            let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_millis(200));
        }
    }
}

impl BindableSocket for UdpSocket {
    fn bind_with(addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        let socket = new_socket(addr, Type::DGRAM, Protocol::UDP, reuse_port)?;
        Ok(socket.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn interrupt(&self, wake_addr: SocketAddr) {
        if let Err(e) = SockRef::from(self).shutdown(Shutdown::Read) {
            trace!("shutting down datagram socket: {}", e);
        }
        // a blocked receive may not notice the shutdown on every platform
        if let Ok(waker) = UdpSocket::bind(SocketAddr::new(wake_addr.ip(), 0)) {
            let _ = waker.send_to(&[], wake_addr);
        }
    }
}


/// Hands out sockets bound to one address, one per worker. The first socket is bound right
///  away so that an ephemeral port (port 0) is resolved once and shared by all workers.
pub struct SocketBinder<S: BindableSocket> {
    addr: SocketAddr,
    reuse_port: bool,
    first: Mutex<Option<S>>,
}

impl <S: BindableSocket> SocketBinder<S> {
    pub fn new(addr: SocketAddr) -> anyhow::Result<SocketBinder<S>> {
        let reuse_port = reuse_port_supported();
        let first = S::bind_with(addr, reuse_port)?;
        let addr = first.local_addr()?;
        debug!(%addr, reuse_port, "bound socket");
        Ok(SocketBinder {
            addr,
            reuse_port,
            first: Mutex::new(Some(first)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// the address to connect / send to in order to reach this binder's sockets locally
    pub fn wake_addr(&self) -> SocketAddr {
        let ip = match self.addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.addr.port())
    }

    /// A socket for one worker. Without port reuse, there is only ever the one socket.
    pub fn socket(&self) -> anyhow::Result<S> {
        if let Some(first) = self.first.lock().take() {
            return Ok(first);
        }
        if !self.reuse_port {
            anyhow::bail!("{} is already in use by another worker, and port reuse is not supported", self.addr);
        }
        Ok(S::bind_with(self.addr, true)?)
    }

    /// Takes a socket for a worker and arranges for it to be interrupted when `cancel` fires
    pub fn socket_for_worker(&self, cancel: &CancelToken) -> anyhow::Result<std::sync::Arc<S>> {
        let socket = std::sync::Arc::new(self.socket()?);
        let s = socket.clone();
        let wake_addr = self.wake_addr();
        cancel.on_cancel(move || s.interrupt(wake_addr));
        Ok(socket)
    }
}
