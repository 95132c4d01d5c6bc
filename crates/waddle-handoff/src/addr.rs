//! Listen addresses and the matching rule used to pair a requested address
//! with an inherited listener.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Transport family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    UnixPacket,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::UnixPacket => "unixpacket",
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Network::Unix | Network::UnixPacket)
    }

    /// Family name used when comparing addresses. All TCP variants share
    /// `"tcp"`; Unix stream and seqpacket sockets stay distinct.
    pub fn family(&self) -> &'static str {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => "tcp",
            Network::Unix => "unix",
            Network::UnixPacket => "unixpacket",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::UnixPacket),
            other => Err(Error::UnknownNetwork(other.to_string())),
        }
    }
}

/// A TCP endpoint. `ip` is `None` for "all interfaces" (`":8080"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpAddr {
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl TcpAddr {
    pub fn new(ip: Option<IpAddr>, port: u16) -> Self {
        Self { ip, port }
    }

    /// Resolve `"host:port"`, `"[v6]:port"` or `":port"` for a TCP network.
    ///
    /// Hostnames go through the system resolver; the first address of a
    /// family the network allows wins (IPv4 preferred for plain `tcp`).
    pub fn resolve(network: Network, address: &str) -> Result<Self> {
        if !network.is_tcp() {
            return Err(Error::UnknownNetwork(network.to_string()));
        }

        let (host, port) = split_host_port(address)
            .ok_or_else(|| Error::resolve(network, address, "missing port in address"))?;
        if host.contains(':') && !address.starts_with('[') {
            return Err(Error::resolve(network, address, "too many colons in address"));
        }

        let port: u16 = if port.is_empty() {
            0
        } else {
            port.parse()
                .map_err(|_| Error::resolve(network, address, format!("invalid port {port:?}")))?
        };

        if host.is_empty() {
            return Ok(Self::new(None, port));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !family_allows(network, &ip) {
                return Err(Error::resolve(network, address, "no suitable address found"));
            }
            return Ok(Self::new(Some(ip), port));
        }

        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::resolve(network, address, e))?
            .collect();

        let picked = match network {
            Network::Tcp => candidates
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| candidates.first()),
            _ => candidates.iter().find(|a| family_allows(network, &a.ip())),
        };

        picked
            .map(|a| Self::new(Some(a.ip()), port))
            .ok_or_else(|| Error::resolve(network, address, "no suitable address found"))
    }
}

impl From<SocketAddr> for TcpAddr {
    /// IPv4-mapped IPv6 addresses become plain IPv4.
    fn from(addr: SocketAddr) -> Self {
        Self::new(Some(addr.ip().to_canonical()), addr.port())
    }
}

impl fmt::Display for TcpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            None => write!(f, ":{}", self.port),
            Some(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Some(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => write!(f, "{}:{}", v4, self.port),
                None => write!(f, "[{}]:{}", ip, self.port),
            },
        }
    }
}

/// A Unix domain socket endpoint. An empty path means an unnamed socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixAddr {
    network: Network,
    path: PathBuf,
}

impl UnixAddr {
    pub fn new(network: Network, path: impl Into<PathBuf>) -> Result<Self> {
        if !network.is_unix() {
            return Err(Error::UnknownNetwork(network.to_string()));
        }
        Ok(Self {
            network,
            path: path.into(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for UnixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Address of a listener of any supported family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Tcp(TcpAddr),
    Unix(UnixAddr),
}

impl ListenAddr {
    pub fn family(&self) -> &'static str {
        match self {
            ListenAddr::Tcp(_) => Network::Tcp.family(),
            ListenAddr::Unix(addr) => addr.network.family(),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => addr.fmt(f),
            ListenAddr::Unix(addr) => addr.fmt(f),
        }
    }
}

impl From<TcpAddr> for ListenAddr {
    fn from(addr: TcpAddr) -> Self {
        ListenAddr::Tcp(addr)
    }
}

impl From<UnixAddr> for ListenAddr {
    fn from(addr: UnixAddr) -> Self {
        ListenAddr::Unix(addr)
    }
}

const IPV6_WILDCARD: &str = "[::]";
const IPV4_WILDCARD: &str = "0.0.0.0";

/// Whether two addresses name the same bind target.
///
/// A listener bound to `[::]:80` (what the kernel reports for a dual-stack
/// wildcard) matches a request for `0.0.0.0:80` or `:80`.
pub fn same_addr(a: &ListenAddr, b: &ListenAddr) -> bool {
    if a.family() != b.family() {
        return false;
    }

    let a = a.to_string();
    let b = b.to_string();
    if a == b {
        return true;
    }

    let strip = |s: &str| -> String {
        let s = s.strip_prefix(IPV6_WILDCARD).unwrap_or(s);
        s.strip_prefix(IPV4_WILDCARD).unwrap_or(s).to_string()
    };
    strip(&a) == strip(&b)
}

fn family_allows(network: Network, ip: &IpAddr) -> bool {
    match network {
        Network::Tcp4 => ip.is_ipv4(),
        Network::Tcp6 => ip.is_ipv6(),
        _ => true,
    }
}

/// Split at the last colon, dropping brackets around an IPv6 host.
fn split_host_port(address: &str) -> Option<(&str, &str)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    address.rsplit_once(':')
}
