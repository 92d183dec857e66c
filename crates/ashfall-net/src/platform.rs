//! TCP socket tuning shared by the client and both servers.
//!
//! Every dialled or accepted stream goes through [`configure_stream`];
//! listeners come from [`create_listener`] with `SO_REUSEADDR` so a restarted
//! service can rebind its port immediately.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Kernel keepalive probing for half-dead peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Silence before the first probe.
    pub idle: Duration,
    pub interval: Duration,
    /// Unanswered probes before the kernel drops the connection. Ignored on macOS.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

/// Socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub nodelay: bool,
    /// `None` leaves keepalive off. Default: on, see [`Keepalive`].
    pub keepalive: Option<Keepalive>,
    /// `SO_RCVBUF`; `None` keeps the OS default.
    pub recv_buffer_size: Option<usize>,
    /// `SO_SNDBUF`; `None` keeps the OS default.
    pub send_buffer_size: Option<usize>,
    /// `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Keepalive::default()),
            recv_buffer_size: None,
            send_buffer_size: None,
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply `config` to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    let sock = SockRef::from(stream);

    if let Some(ka) = &config.keepalive {
        let params = TcpKeepalive::new().with_time(ka.idle).with_interval(ka.interval);
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let params = params.with_retries(ka.retries);
        sock.set_tcp_keepalive(&params)?;
    }
    if let Some(size) = config.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Bind a non-blocking listener on `addr`. IPv6 addresses are bound dual-stack.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
