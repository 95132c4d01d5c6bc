//! Listener types and the two ways to get one: wrapping an inherited
//! descriptor, or binding a fresh socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::warn;

use crate::addr::{ListenAddr, Network, TcpAddr, UnixAddr};

/// A listening socket handed out by [`Net`](crate::Net).
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) => Network::Tcp,
            Listener::Unix(l) => l.network(),
        }
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Listener::Tcp(l) => Ok(ListenAddr::Tcp(TcpAddr::from(l.local_addr()?))),
            Listener::Unix(l) => Ok(ListenAddr::Unix(l.local_addr().clone())),
        }
    }

    /// The TCP listener, or `self` back if this is a Unix listener.
    pub fn into_tcp(self) -> Result<TcpListener, Listener> {
        match self {
            Listener::Tcp(l) => Ok(l),
            other => Err(other),
        }
    }

    /// The Unix listener, or `self` back if this is a TCP listener.
    pub fn into_unix(self) -> Result<UnixListener, Listener> {
        match self {
            Listener::Unix(l) => Ok(l),
            other => Err(other),
        }
    }

    /// Wrap an inherited descriptor. Takes ownership: on error the
    /// descriptor is closed.
    pub(crate) fn from_inherited(fd: OwnedFd) -> io::Result<Listener> {
        set_cloexec(fd.as_fd())?;
        let socket = Socket::from(fd);

        if !is_listening(&socket)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not listening",
            ));
        }

        let ty = socket.r#type()?;
        let family = libc::c_int::from(socket.local_addr()?.family());
        match family {
            libc::AF_INET | libc::AF_INET6 if ty == Type::STREAM => {
                Ok(Listener::Tcp(TcpListener::from(OwnedFd::from(socket))))
            }
            libc::AF_UNIX if ty == Type::STREAM || ty == Type::SEQPACKET => {
                let network = if ty == Type::STREAM {
                    Network::Unix
                } else {
                    Network::UnixPacket
                };
                let addr = UnixAddr::new(network, unix_path(&socket)?)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
                Ok(Listener::Unix(UnixListener { socket, addr }))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported socket (family {family}, type {ty:?})"),
            )),
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Self {
        Listener::Tcp(l)
    }
}

impl From<UnixListener> for Listener {
    fn from(l: UnixListener) -> Self {
        Listener::Unix(l)
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl From<Listener> for OwnedFd {
    fn from(l: Listener) -> Self {
        match l {
            Listener::Tcp(l) => l.into(),
            Listener::Unix(l) => l.into(),
        }
    }
}

impl IntoRawFd for Listener {
    fn into_raw_fd(self) -> RawFd {
        OwnedFd::from(self).into_raw_fd()
    }
}

/// A listening Unix domain socket, either stream (`unix`) or seqpacket
/// (`unixpacket`).
#[derive(Debug)]
pub struct UnixListener {
    socket: Socket,
    addr: UnixAddr,
}

impl UnixListener {
    pub fn network(&self) -> Network {
        self.addr.network()
    }

    pub fn local_addr(&self) -> &UnixAddr {
        &self.addr
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        self.socket.accept()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    /// Convert a stream listener into the standard library type. Seqpacket
    /// listeners have no std counterpart and are handed back unchanged.
    pub fn into_std(self) -> Result<std::os::unix::net::UnixListener, UnixListener> {
        match self.network() {
            Network::Unix => Ok(OwnedFd::from(self.socket).into()),
            _ => Err(self),
        }
    }
}

impl AsFd for UnixListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl AsRawFd for UnixListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl From<UnixListener> for OwnedFd {
    fn from(l: UnixListener) -> Self {
        l.socket.into()
    }
}

impl IntoRawFd for UnixListener {
    fn into_raw_fd(self) -> RawFd {
        self.socket.into_raw_fd()
    }
}

/// Bind a fresh TCP listener.
///
/// A wildcard `tcp` address binds the dual-stack `[::]`, falling back to
/// `0.0.0.0` on hosts without IPv6.
pub(crate) fn bind_tcp(network: Network, addr: &TcpAddr, backlog: i32) -> io::Result<TcpListener> {
    let v4_any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port));
    let v6_any = SocketAddr::from((Ipv6Addr::UNSPECIFIED, addr.port));

    match (network, addr.ip) {
        (Network::Tcp4, None) => bind_tcp_socket(v4_any, false, backlog),
        (Network::Tcp6, None) => bind_tcp_socket(v6_any, true, backlog),
        (_, None) => match bind_tcp_socket(v6_any, false, backlog) {
            Err(e) if e.raw_os_error() == Some(libc::EAFNOSUPPORT) => {
                warn!(port = addr.port, "IPv6 unavailable, binding IPv4 wildcard");
                bind_tcp_socket(v4_any, false, backlog)
            }
            result => result,
        },
        (_, Some(ip)) => bind_tcp_socket(
            SocketAddr::new(ip, addr.port),
            network == Network::Tcp6,
            backlog,
        ),
    }
}

fn bind_tcp_socket(addr: SocketAddr, only_v6: bool, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(only_v6)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Bind a fresh Unix domain listener of the address's network type.
pub(crate) fn bind_unix(addr: &UnixAddr, backlog: i32) -> io::Result<UnixListener> {
    let ty = match addr.network() {
        Network::UnixPacket => Type::SEQPACKET,
        _ => Type::STREAM,
    };
    let socket = Socket::new(Domain::UNIX, ty, None)?;
    socket.bind(&SockAddr::unix(addr.path())?)?;
    socket.listen(backlog)?;

    let addr = UnixAddr::new(addr.network(), unix_path(&socket)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    Ok(UnixListener { socket, addr })
}

/// Filesystem path a Unix socket is bound to; empty for unnamed or abstract sockets.
fn unix_path(socket: &Socket) -> io::Result<PathBuf> {
    let probe = std::os::unix::net::UnixListener::from(OwnedFd::from(socket.try_clone()?));
    Ok(probe
        .local_addr()?
        .as_pathname()
        .map(Path::to_path_buf)
        .unwrap_or_default())
}

fn is_listening(socket: &Socket) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len describe a valid c_int buffer for the duration of the call.
    let result = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value != 0)
}

pub(crate) fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: raw is a valid open descriptor borrowed for the duration of the calls.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC == 0 {
        let result = unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
