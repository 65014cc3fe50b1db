//! Transport capability trait.
//!
//! Every connection object the gateway moves bytes over implements
//! [`Transport`]. Beyond plain async I/O it answers two static capability
//! queries used by the proxy loop: whether the object is a raw TCP socket
//! that can be spliced, and whether it holds replay bytes that must be
//! flushed before splicing.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A bidirectional byte stream the gateway can proxy.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
    /// The raw TCP socket, if this transport is one and can be spliced.
    fn tcp(&self) -> Option<&TcpStream> {
        None
    }

    /// Bytes already read off the wire that the next reader must see first.
    fn pending(&self) -> &[u8] {
        &[]
    }

    /// Mark `n` bytes of [`Transport::pending`] as delivered.
    fn consume_pending(&mut self, _n: usize) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp().and_then(|s| s.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.tcp().and_then(|s| s.peer_addr().ok())
    }
}

/// Owned, type-erased transport.
pub type BoxTransport = Box<dyn Transport>;

impl Transport for TcpStream {
    fn tcp(&self) -> Option<&TcpStream> {
        Some(self)
    }
}

impl Transport for DuplexStream {}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

impl<T: Transport> Transport for tokio_rustls::server::TlsStream<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<T: Transport> Transport for tokio_rustls::client::TlsStream<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn tcp(&self) -> Option<&TcpStream> {
        (**self).tcp()
    }

    fn pending(&self) -> &[u8] {
        (**self).pending()
    }

    fn consume_pending(&mut self, n: usize) {
        (**self).consume_pending(n)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Both ends are raw TCP sockets and the platform can splice between them.
pub fn can_splice(a: &dyn Transport, b: &dyn Transport) -> bool {
    cfg!(target_os = "linux") && a.tcp().is_some() && b.tcp().is_some()
}

/// Send FIN on a socket shared by reference.
#[cfg(target_os = "linux")]
pub(crate) fn shutdown_write(tcp: &TcpStream) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe { libc::shutdown(tcp.as_raw_fd(), libc::SHUT_WR) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Make the next close of this socket send RST instead of FIN.
#[cfg(unix)]
pub(crate) fn reset_on_close(tcp: &TcpStream) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            tcp.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn reset_on_close(_tcp: &TcpStream) -> std::io::Result<()> {
    Ok(())
}
