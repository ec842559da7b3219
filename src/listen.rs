//! Listener construction from address strings.
//!
//! Addresses may be prefixed by a URL scheme selecting the network
//! (`tcp://`, `unix://`, `fd://`, ...). Without a scheme the network is
//! guessed: anything with a host and port is TCP, an absolute path is a
//! unix-domain socket, and a network-interface name binds every address
//! that interface carries, producing a compound listener.
//!
//! `fd://N` adopts the already-listening descriptor `N` inherited from a
//! parent process.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

use crate::conn::{MultiAddr, NetAddr, Stream};
use crate::error::is_temporary;

const STREAM_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6", "unix", "unixpacket", "fd"];
const PACKET_NETWORKS: &[&str] = &["udp", "udp4", "udp6", "ip", "ip4", "ip6", "unixdgram", "fd"];

/// Anything that produces connections.
///
/// The connection server is written against this trait so that tests can
/// substitute scripted accept sequences for real sockets.
#[async_trait]
pub trait Accept: Send {
    async fn accept(&mut self) -> io::Result<Box<dyn Stream>>;

    fn local_addr(&self) -> io::Result<NetAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<Box<dyn Stream>> {
        let (conn, _) = TcpListener::accept(self).await?;
        Ok(Box::new(conn))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        TcpListener::local_addr(self).map(NetAddr::tcp)
    }
}

#[async_trait]
impl Accept for UnixListener {
    async fn accept(&mut self) -> io::Result<Box<dyn Stream>> {
        let (conn, _) = UnixListener::accept(self).await?;
        Ok(Box::new(conn))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        UnixListener::local_addr(self).map(|a| NetAddr::unix(&a))
    }
}

/// A stream listener built by [`listen`].
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Multi(MultiListener),
}

#[async_trait]
impl Accept for Listener {
    async fn accept(&mut self) -> io::Result<Box<dyn Stream>> {
        match self {
            Listener::Tcp(l) => Accept::accept(l).await,
            Listener::Unix(l) => Accept::accept(l).await,
            Listener::Multi(l) => l.accept().await,
        }
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            Listener::Tcp(l) => Accept::local_addr(l),
            Listener::Unix(l) => Accept::local_addr(l),
            Listener::Multi(l) => Ok(l.local_addr()),
        }
    }
}

/// Builds a stream listener for `address`.
///
/// Accepted networks are `tcp`, `tcp4`, `tcp6`, `unix`, `unixpacket`, and
/// `fd`. When the address names a network interface, one listener is bound
/// per interface address and the result is a compound listener.
pub async fn listen(address: &str) -> io::Result<Listener> {
    let (network, rest) = split_scheme(address, STREAM_NETWORKS)?;

    match network.unwrap_or_else(|| guess_network(rest)) {
        "fd" => {
            let fd = parse_fd(rest)?;
            let std = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
            std.set_nonblocking(true)?;
            Ok(Listener::Unix(UnixListener::from_std(std)?))
        }
        "unix" => Ok(Listener::Unix(UnixListener::bind(PathBuf::from(rest))?)),
        "unixpacket" => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unixpacket sockets are not supported",
        )),
        tcp => {
            let binds = resolve_tcp(rest, tcp)?;
            if binds.len() == 1 {
                return Ok(Listener::Tcp(TcpListener::bind(binds[0]).await?));
            }
            let mut children = Vec::with_capacity(binds.len());
            for b in binds {
                match TcpListener::bind(b).await {
                    Ok(l) => children.push(l),
                    Err(e) => return Err(e),
                }
            }
            Ok(Listener::Multi(MultiListener::new(children)))
        }
    }
}

/// A packet endpoint built by [`listen_packet`].
#[derive(Debug)]
pub enum PacketConn {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl PacketConn {
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetAddr)> {
        match self {
            PacketConn::Udp(s) => {
                let (n, addr) = s.recv_from(buf).await?;
                Ok((n, NetAddr::new("udp", addr.to_string())))
            }
            PacketConn::Unix(s) => {
                let (n, addr) = s.recv_from(buf).await?;
                let path = addr
                    .as_pathname()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "@".to_string());
                Ok((n, NetAddr::new("unixgram", path)))
            }
        }
    }

    pub async fn send_to(&self, buf: &[u8], addr: &NetAddr) -> io::Result<usize> {
        match self {
            PacketConn::Udp(s) => {
                let target: SocketAddr = addr
                    .addr
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad udp address"))?;
                s.send_to(buf, target).await
            }
            PacketConn::Unix(s) => s.send_to(buf, &addr.addr).await,
        }
    }

    pub fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            PacketConn::Udp(s) => s.local_addr().map(|a| NetAddr::new("udp", a.to_string())),
            PacketConn::Unix(s) => s.local_addr().map(|a| {
                let path = a
                    .as_pathname()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "@".to_string());
                NetAddr::new("unixgram", path)
            }),
        }
    }
}

/// Builds a packet endpoint for `address`. Accepted networks are `udp`,
/// `udp4`, `udp6`, `unixdgram`, and `fd`; raw `ip` sockets are recognized in
/// the grammar but not supported by the runtime.
pub async fn listen_packet(address: &str) -> io::Result<PacketConn> {
    let (network, rest) = split_scheme(address, PACKET_NETWORKS)?;

    match network.unwrap_or_else(|| guess_packet_network(rest)) {
        "fd" => {
            let fd = parse_fd(rest)?;
            let std = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(fd) };
            std.set_nonblocking(true)?;
            Ok(PacketConn::Unix(UnixDatagram::from_std(std)?))
        }
        "unixdgram" => Ok(PacketConn::Unix(UnixDatagram::bind(PathBuf::from(rest))?)),
        "ip" | "ip4" | "ip6" => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "raw ip sockets are not supported",
        )),
        udp => {
            let binds = resolve_tcp(rest, udp)?;
            Ok(PacketConn::Udp(UdpSocket::bind(binds.as_slice()).await?))
        }
    }
}

/// A compound listener: one accept task per child publishes into a shared
/// channel, and `accept` returns whichever connection arrives first.
#[derive(Debug)]
pub struct MultiListener {
    rx: mpsc::Receiver<io::Result<Box<dyn Stream>>>,
    tasks: JoinSet<()>,
    addr: MultiAddr,
}

impl MultiListener {
    pub fn new(children: Vec<TcpListener>) -> Self {
        let addr = MultiAddr(
            children
                .iter()
                .map(|l| {
                    l.local_addr()
                        .map(NetAddr::tcp)
                        .unwrap_or_else(|_| NetAddr::new("tcp", "?"))
                })
                .collect(),
        );

        let (tx, rx) = mpsc::channel(1);
        let mut tasks = JoinSet::new();

        for child in children {
            let tx = tx.clone();
            tasks.spawn(async move {
                loop {
                    match TcpListener::accept(&child).await {
                        Ok((conn, _)) => {
                            if tx.send(Ok(Box::new(conn) as Box<dyn Stream>)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let fatal = !is_temporary(&e);
                            if tx.send(Err(e)).await.is_err() || fatal {
                                return;
                            }
                        }
                    }
                }
            });
        }

        Self { rx, tasks, addr }
    }

    pub async fn accept(&mut self) -> io::Result<Box<dyn Stream>> {
        match self.rx.recv().await {
            Some(res) => res,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener closed",
            )),
        }
    }

    pub fn local_addr(&self) -> NetAddr {
        NetAddr::new(self.addr.net(), self.addr.to_string())
    }

    /// Stops every child listener and closes any connection that was
    /// accepted but not yet handed out.
    pub fn close(&mut self) {
        self.tasks.abort_all();
        self.rx.close();
        while let Ok(conn) = self.rx.try_recv() {
            drop(conn);
        }
    }
}

impl Drop for MultiListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn split_scheme<'a>(
    address: &'a str,
    networks: &'static [&'static str],
) -> io::Result<(Option<&'static str>, &'a str)> {
    match address.find("://") {
        None => Ok((None, address)),
        Some(off) => {
            let scheme = &address[..off];
            for net in networks {
                if *net == scheme {
                    return Ok((Some(net), &address[off + 3..]));
                }
            }
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported protocol: {scheme}"),
            ))
        }
    }
}

fn parse_fd(s: &str) -> io::Result<RawFd> {
    match s.parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file descriptor in fd://{s}"),
        )),
    }
}

fn guess_network(address: &str) -> &'static str {
    if address.starts_with('/') {
        "unix"
    } else {
        "tcp"
    }
}

fn guess_packet_network(address: &str) -> &'static str {
    if address.starts_with('/') {
        "unixdgram"
    } else {
        "udp"
    }
}

/// Expands `address` into the socket addresses to bind for a TCP-family
/// network. Interface names expand to every address the interface carries.
fn resolve_tcp(address: &str, network: &str) -> io::Result<Vec<SocketAddr>> {
    let (host, port) = split_host_port(address);

    let port: u16 = match port {
        Some(p) => p.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in {address}"))
        })?,
        None => 0,
    };

    if host.is_empty() {
        // Wildcard host.
        let ip = match network {
            "tcp6" | "udp6" => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    // An interface name expands to everything the interface carries; any
    // other name goes through the system resolver.
    let mut addrs: Vec<SocketAddr> = match interface_addrs(host) {
        Ok(ips) => ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
        Err(_) => {
            use std::net::ToSocketAddrs;
            (host, port)
                .to_socket_addrs()
                .map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("cannot resolve {host}: {e}"),
                    )
                })?
                .collect()
        }
    };

    match network {
        "tcp4" | "udp4" => addrs.retain(|a| a.is_ipv4()),
        "tcp6" | "udp6" => addrs.retain(|a| a.is_ipv6()),
        _ => {}
    }
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {host}"),
        ));
    }
    Ok(addrs)
}

/// Splits `host:port`, handling `[v6]:port` brackets and a bare leading `:`
/// for the wildcard host. Returns no port when the address has none.
fn split_host_port(address: &str) -> (&str, Option<&str>) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            if let Some(port) = tail.strip_prefix(':') {
                return (host, Some(port));
            }
            return (host, None);
        }
    }
    match address.rfind(':') {
        // More than one colon and no brackets: a bare IPv6 host.
        Some(_) if address.matches(':').count() > 1 => (address, None),
        Some(off) => (&address[..off], Some(&address[off + 1..])),
        None => (address, None),
    }
}

/// Addresses assigned to the named network interface, via `getifaddrs`.
fn interface_addrs(name: &str) -> io::Result<Vec<IpAddr>> {
    let mut addrs = Vec::new();
    let mut list: *mut libc::ifaddrs = std::ptr::null_mut();

    if unsafe { libc::getifaddrs(&mut list) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut cursor = list;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        let ifa_name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if ifa_name.to_bytes() != name.as_bytes() || entry.ifa_addr.is_null() {
            continue;
        }

        match unsafe { (*entry.ifa_addr).sa_family } as i32 {
            libc::AF_INET => {
                let sa = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                addrs.push(IpAddr::V4(ip));
            }
            libc::AF_INET6 => {
                let sa = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
                if (ip.segments()[0] & 0xffc0) == 0xfe80 {
                    // Binding a link-local address needs its scope; skip
                    // rather than bind something unusable.
                    warn!(interface = name, address = %ip, "skipping link-local address");
                    continue;
                }
                addrs.push(IpAddr::V6(ip));
            }
            _ => {}
        }
    }

    unsafe { libc::freeifaddrs(list) };

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such network interface: {name}"),
        ));
    }
    Ok(addrs)
}
