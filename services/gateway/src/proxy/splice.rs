//! Zero-copy socket-to-socket transfer with `splice(2)`.
//!
//! Each direction owns a non-blocking pipe. A chunk is moved socket → pipe
//! when the source is readable, then pipe → socket until the pipe is empty,
//! so the pipe never holds data when the next read starts. Readiness comes
//! from tokio's reactor; the kernel does the copying.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::cancelled;
use super::copy::Half;
use super::stream::StreamStats;
use super::transport::shutdown_write;

/// Largest chunk moved per `splice` call.
const SPLICE_CHUNK: usize = 64 * 1024;

/// Which socket a splice failure came from.
#[derive(Debug)]
pub(crate) enum SpliceError {
    Read(io::Error),
    Write(io::Error),
    Aborted,
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }
}

fn splice_fd(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    let n = unsafe {
        libc::splice(
            from,
            std::ptr::null_mut(),
            to,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Move bytes from `src` to `dst` until EOF, error or abort.
///
/// On clean EOF the write side of `dst` is shut down. Returns the number of
/// bytes moved.
pub(crate) async fn splice_half(
    src: &TcpStream,
    dst: &TcpStream,
    half: Half,
    stats: &StreamStats,
    mut abort: watch::Receiver<bool>,
) -> Result<u64, SpliceError> {
    let pipe = Pipe::new().map_err(SpliceError::Read)?;
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancelled(&mut abort) => return Err(SpliceError::Aborted),
            r = read_chunk(src, &pipe) => r.map_err(SpliceError::Read)?,
        };
        if n == 0 {
            break;
        }

        let mut pending = n;
        while pending > 0 {
            let written = tokio::select! {
                biased;
                _ = cancelled(&mut abort) => return Err(SpliceError::Aborted),
                r = write_chunk(&pipe, dst, pending) => r.map_err(SpliceError::Write)?,
            };
            pending -= written;
        }
        half.record(stats, n);
        total += n as u64;
    }

    if half.claim_close(stats) {
        shutdown_write(dst).map_err(SpliceError::Write)?;
    }
    Ok(total)
}

async fn read_chunk(src: &TcpStream, pipe: &Pipe) -> io::Result<usize> {
    loop {
        src.readable().await?;
        match src.try_io(Interest::READABLE, || {
            splice_fd(src.as_raw_fd(), pipe.write.as_raw_fd(), SPLICE_CHUNK)
        }) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn write_chunk(pipe: &Pipe, dst: &TcpStream, len: usize) -> io::Result<usize> {
    loop {
        dst.writable().await?;
        match dst.try_io(Interest::WRITABLE, || {
            splice_fd(pipe.read.as_raw_fd(), dst.as_raw_fd(), len)
        }) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}
