//! Transport connections to the remote relay
//!
//! The relay treats a transport as a packet pipe: every `write` carries one
//! frame and every successful `read` is taken to be one frame, the same
//! contract `socat` offers on its TUN side. Reads are non-blocking once the
//! connection is up.

use crate::cancel::{CancelToken, Cancelled};
use crate::config::{RemoteEndpoint, TransportKind};
use crate::error::BridgeError;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a frame may sit in a full send buffer before the session is
/// considered dead.
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(30);

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[cfg(unix)]
pub type RawSocket = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;

/// Platform hook that keeps a socket's own traffic out of the interface it
/// is carrying (Android's `VpnService.protect`, an `SO_MARK` on Linux, ...).
pub trait SocketProtector: Send + Sync {
    /// `false` means the socket cannot be exempted.
    fn protect(&self, socket: RawSocket) -> bool;
}

/// For platforms where routing already excludes the relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: RawSocket) -> bool {
        true
    }
}

/// Duplex connection to the remote relay.
pub trait Transport: Send {
    /// Establish the connection (blocking).
    fn connect(&mut self) -> io::Result<()>;

    /// Underlying socket, once connected.
    fn raw_socket(&self) -> Option<RawSocket>;

    /// Exempt this connection from the tunnel. Transports without a socket
    /// have nothing to protect.
    fn protect(&self, protector: &dyn SocketProtector) -> bool {
        match self.raw_socket() {
            Some(socket) => protector.protect(socket),
            None => true,
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Read one frame. `Ok(0)` means the peer closed the connection;
    /// `WouldBlock` means nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one whole frame. Waiting on a full send buffer stops as soon
    /// as `cancel` fires, and fails with `TimedOut` after
    /// [`WRITE_STALL_TIMEOUT`].
    fn write(&mut self, frame: &[u8], cancel: &CancelToken) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Builds transports for a remote endpoint descriptor.
pub trait TransportFactory: Send + Sync {
    fn create(&self, remote: &RemoteEndpoint) -> Result<Box<dyn Transport>, BridgeError>;
}

/// Plain-socket transports from the standard library.
#[derive(Debug, Clone)]
pub struct NetTransportFactory {
    connect_timeout: Duration,
}

impl NetTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for NetTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TransportFactory for NetTransportFactory {
    fn create(&self, remote: &RemoteEndpoint) -> Result<Box<dyn Transport>, BridgeError> {
        debug!("Creating {} transport to {}", remote.kind, remote);
        Ok(match remote.kind {
            TransportKind::Tcp => Box::new(TcpTransport::new(remote.clone(), self.connect_timeout)),
            TransportKind::Udp => Box::new(UdpTransport::new(remote.clone())),
        })
    }
}

/// `WouldBlock` and `Interrupted` just mean "try again later".
pub fn is_pending(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport not connected")
}

fn resolve(remote: &RemoteEndpoint) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = remote.authority().to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", remote.host),
        ));
    }
    Ok(addrs)
}

/// Wait before retrying a write the socket could not take. Errors out on
/// cancellation or once the stall has lasted `stall_timeout`.
fn wait_writable(
    cancel: &CancelToken,
    stalled_since: Instant,
    stall_timeout: Duration,
) -> io::Result<()> {
    if stalled_since.elapsed() >= stall_timeout {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("peer stopped draining for {:?}", stall_timeout),
        ));
    }
    cancel
        .sleep(WRITE_RETRY_INTERVAL)
        .map_err(|e: Cancelled| io::Error::other(e))
}

/// Push a whole frame through a possibly non-blocking writer.
fn write_frame<W: Write>(
    writer: &mut W,
    mut frame: &[u8],
    cancel: &CancelToken,
    stall_timeout: Duration,
) -> io::Result<()> {
    let mut stalled_since = None;
    while !frame.is_empty() {
        match writer.write(frame) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                frame = &frame[n..];
                stalled_since = None;
            }
            Err(e) if is_pending(&e) => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                wait_writable(cancel, since, stall_timeout)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn raw_of<S: std::os::fd::AsRawFd>(socket: &S) -> RawSocket {
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_of<S: std::os::windows::io::AsRawSocket>(socket: &S) -> RawSocket {
    socket.as_raw_socket()
}

/// TCP stream transport
///
/// TCP keeps no frame boundaries: each read hands over whatever bytes have
/// arrived, so frames the peer sent back to back can come out as one.
pub struct TcpTransport {
    remote: RemoteEndpoint,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(remote: RemoteEndpoint, connect_timeout: Duration) -> Self {
        Self {
            remote,
            connect_timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> io::Result<()> {
        let mut last_err = None;
        for addr in resolve(&self.remote)? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!("Connected to {} ({})", self.remote, addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(not_connected))
    }

    fn raw_socket(&self) -> Option<RawSocket> {
        self.stream.as_ref().map(raw_of)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.stream()?.set_nonblocking(nonblocking)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write(&mut self, frame: &[u8], cancel: &CancelToken) -> io::Result<()> {
        write_frame(self.stream()?, frame, cancel, WRITE_STALL_TIMEOUT)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => stream.shutdown(std::net::Shutdown::Both),
            None => Ok(()),
        }
    }
}

/// Connected UDP socket transport, one frame per datagram
pub struct UdpTransport {
    remote: RemoteEndpoint,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(remote: RemoteEndpoint) -> Self {
        Self {
            remote,
            socket: None,
        }
    }

    fn socket(&mut self) -> io::Result<&mut UdpSocket> {
        self.socket.as_mut().ok_or_else(not_connected)
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> io::Result<()> {
        let mut last_err = None;
        for addr in resolve(&self.remote)? {
            let bind: SocketAddr = if addr.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let attempt = UdpSocket::bind(bind).and_then(|socket| {
                socket.connect(addr)?;
                Ok(socket)
            });
            match attempt {
                Ok(socket) => {
                    info!("UDP transport bound for {} ({})", self.remote, addr);
                    self.socket = Some(socket);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(not_connected))
    }

    fn raw_socket(&self) -> Option<RawSocket> {
        self.socket.as_ref().map(raw_of)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.socket()?.set_nonblocking(nonblocking)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Datagrams never signal end of stream; an empty one carries nothing.
        match self.socket()?.recv(buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn write(&mut self, frame: &[u8], cancel: &CancelToken) -> io::Result<()> {
        let socket = self.socket()?;
        let mut stalled_since = None;
        loop {
            match socket.send(frame) {
                Ok(_) => return Ok(()),
                Err(e) if is_pending(&e) => {
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    wait_writable(cancel, since, WRITE_STALL_TIMEOUT)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::net::TcpListener;
    use std::thread;

    struct DenyAll;

    impl SocketProtector for DenyAll {
        fn protect(&self, _socket: RawSocket) -> bool {
            false
        }
    }

    fn local(port: u16, kind: TransportKind) -> RemoteEndpoint {
        RemoteEndpoint::new("127.0.0.1", port, kind)
    }

    #[test]
    fn test_tcp_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let factory = NetTransportFactory::default();
        let mut transport = factory.create(&local(port, TransportKind::Tcp)).unwrap();
        assert!(transport.raw_socket().is_none());

        transport.connect().unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        assert!(transport.protect(&NoopProtector));
        assert!(!transport.protect(&DenyAll));

        transport.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        let err = transport.read(&mut buf).unwrap_err();
        assert!(is_pending(&err));

        let (_handle, token) = cancel_pair();
        transport.write(b"ping", &token).unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        // Peer hanging up shows as a zero-length read.
        drop(peer);
        let n = loop {
            match transport.read(&mut buf) {
                Err(e) if is_pending(&e) => thread::sleep(Duration::from_millis(5)),
                other => break other.unwrap(),
            }
        };
        assert_eq!(n, 0);

        // Shutting down a socket the peer already closed may fail; either
        // way the transport is released.
        let _ = transport.close();
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_tcp_reads_carry_no_frame_boundaries() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let remote = local(port, TransportKind::Tcp);
        let mut transport = TcpTransport::new(remote, Duration::from_secs(2));
        transport.connect().unwrap();
        transport.set_nonblocking(true).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        // Two framed packets in one burst.
        peer.write_all(&[0, 0, 8, 0, 69, 1, 2, 3, 0, 0, 8, 0, 69, 9, 9, 9]).unwrap();
        peer.flush().unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < 16 {
            match transport.read(&mut buf) {
                Err(e) if is_pending(&e) => thread::sleep(Duration::from_millis(5)),
                other => received.extend_from_slice(&buf[..other.unwrap()]),
            }
        }
        // The bytes come through as a stream; nothing marks where the
        // second frame starts.
        assert_eq!(received, [0, 0, 8, 0, 69, 1, 2, 3, 0, 0, 8, 0, 69, 9, 9, 9]);
    }

    #[test]
    fn test_tcp_connect_refused() {
        // Grab a free port, then release it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let remote = local(port, TransportKind::Tcp);
        let mut transport = TcpTransport::new(remote, Duration::from_secs(2));
        assert!(transport.connect().is_err());
    }

    #[test]
    fn test_udp_exchange() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let mut transport = UdpTransport::new(local(port, TransportKind::Udp));
        transport.connect().unwrap();
        transport.set_nonblocking(true).unwrap();

        let (_handle, token) = cancel_pair();
        transport.write(b"hello", &token).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        peer.send_to(b"world", from).unwrap();
        let n = loop {
            match transport.read(&mut buf) {
                Err(e) if is_pending(&e) => thread::sleep(Duration::from_millis(5)),
                other => break other.unwrap(),
            }
        };
        assert_eq!(&buf[..n], b"world");

        transport.close().unwrap();
    }

    #[test]
    fn test_write_frame_retries_would_block() {
        struct Flaky {
            calls: usize,
            out: Vec<u8>,
        }

        impl Write for Flaky {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.calls += 1;
                if self.calls % 2 == 1 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                let n = buf.len().min(3);
                self.out.extend_from_slice(&buf[..n]);
                Ok(n)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = Flaky {
            calls: 0,
            out: Vec::new(),
        };
        let (_handle, token) = cancel_pair();
        write_frame(&mut writer, b"abcdefg", &token, WRITE_STALL_TIMEOUT).unwrap();
        assert_eq!(writer.out, b"abcdefg");
    }

    /// Writer whose send buffer never drains.
    struct Full;

    impl Write for Full {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_frame_stops_on_cancel() {
        let (handle, token) = cancel_pair();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let started = Instant::now();
        let err = write_frame(&mut Full, b"stuck", &token, WRITE_STALL_TIMEOUT).unwrap_err();
        canceller.join().unwrap();

        assert!(token.is_cancelled());
        assert_ne!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_write_frame_times_out_on_stall() {
        let (_handle, token) = cancel_pair();
        let err = write_frame(&mut Full, b"stuck", &token, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!token.is_cancelled());
    }
}
