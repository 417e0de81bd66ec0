/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Message-framed local transport between render clients and the server.
 *
 * SOCK_SEQPACKET Unix sockets give exactly the contract the protocol needs:
 * connection-oriented, blocking, and boundary-preserving, so one `send` is
 * observed as one `receive` on the peer. The server endpoint accepts a
 * single client at a time; a second connect queues until the current
 * session ends. */
use crate::tag;
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};
use nix::sys::signal::SigSet;
use nix::sys::socket;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/* Well-known endpoint names. Only the primary endpoint is served; the
 * secondary name is reserved for dual-server operation. */
pub const ENDPOINT_PRIMARY: &str = "com.motionreality.rendermanagerserver.primary";
pub const ENDPOINT_SECONDARY: &str = "com.motionreality.rendermanagerserver.secondary";

/** Resolve an endpoint name to its socket path, preferring the user runtime
 * directory when available */
pub fn endpoint_path(name: &str) -> PathBuf {
    let mut path = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from("/tmp"),
    };
    path.push(name);
    path
}

/** Wait until `fd` is readable. Returns Ok(false) without consuming anything
 * if `stop` was raised; a signal arriving during the poll interrupts it. */
fn wait_readable(
    fd: BorrowedFd<'_>,
    pollmask: Option<&SigSet>,
    stop: &AtomicBool,
) -> Result<bool, String> {
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut pfds = [PollFd::new(fd, PollFlags::POLLIN)];
        match nix::poll::ppoll(&mut pfds, None, pollmask.copied()) {
            Ok(_) => (),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(tag!("Failed to poll socket: {}", e)),
        }
        let rev = pfds[0].revents().unwrap();
        /* On POLLERR/POLLHUP, fall through and let the next I/O surface it */
        if rev.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP) {
            return Ok(true);
        }
    }
}

/** The server's listening endpoint; unlinks its socket path on drop */
pub struct PipeEndpoint {
    socket: OwnedFd,
    path: PathBuf,
}

impl PipeEndpoint {
    pub fn bind(path: &Path) -> Result<PipeEndpoint, String> {
        let sock = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::SeqPacket,
            socket::SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|x| tag!("Failed to create socket: {}", x))?;

        /* A socket file from an earlier run would make bind fail */
        match nix::unistd::unlink(path) {
            Ok(()) => debug!("Removed stale socket at {:?}", path),
            Err(Errno::ENOENT) => (),
            Err(e) => return Err(tag!("Failed to unlink stale socket {:?}: {}", path, e)),
        }

        let addr = socket::UnixAddr::new(path)
            .map_err(|x| tag!("Failed to create socket address for {:?}: {}", path, x))?;
        socket::bind(sock.as_raw_fd(), &addr)
            .map_err(|x| tag!("Failed to bind socket at {:?}: {}", path, x))?;
        socket::listen(&sock, socket::Backlog::new(1).unwrap())
            .map_err(|x| tag!("Failed to listen on socket: {}", x))?;

        Ok(PipeEndpoint {
            socket: sock,
            path: PathBuf::from(path),
        })
    }

    /** Block until a client connects. Returns Ok(None) if `stop` was raised
     * before a connection arrived. */
    pub fn accept(
        &self,
        pollmask: Option<&SigSet>,
        stop: &AtomicBool,
    ) -> Result<Option<PipeConnection>, String> {
        loop {
            if !wait_readable(self.socket.as_fd(), pollmask, stop)? {
                return Ok(None);
            }
            match socket::accept(self.socket.as_raw_fd()) {
                Ok(fd) => {
                    let conn = unsafe {
                        // SAFETY: freshly created file descriptor, exclusively captured here
                        OwnedFd::from_raw_fd(fd)
                    };
                    return Ok(Some(PipeConnection { socket: conn }));
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) | Err(Errno::ECONNABORTED) => {
                    debug!("Failed to receive connection, retrying");
                    continue;
                }
                Err(e) => return Err(tag!("Failed to accept connection: {}", e)),
            }
        }
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if let Err(e) = nix::unistd::unlink(&self.path) {
            if e != Errno::ENOENT {
                error!("Failed to unlink socket at {:?}: {}", self.path, e);
            }
        }
    }
}

/** One connected duplex pipe; either the server's accepted end or the
 * client's connected end */
pub struct PipeConnection {
    socket: OwnedFd,
}

impl PipeConnection {
    pub fn connect(path: &Path) -> Result<PipeConnection, String> {
        let sock = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::SeqPacket,
            socket::SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|x| tag!("Failed to create socket: {}", x))?;
        let addr = socket::UnixAddr::new(path)
            .map_err(|x| tag!("Failed to create socket address for {:?}: {}", path, x))?;
        socket::connect(sock.as_raw_fd(), &addr)
            .map_err(|x| tag!("Failed to connect to socket at {:?}: {}", path, x))?;
        Ok(PipeConnection { socket: sock })
    }

    /** Deliver exactly one framed message */
    pub fn send(&self, msg: &[u8]) -> Result<(), String> {
        let n = socket::send(self.socket.as_raw_fd(), msg, socket::MsgFlags::empty())
            .map_err(|x| tag!("Failed to send message: {}", x))?;
        if n != msg.len() {
            return Err(tag!("Partial send: {} of {} bytes", n, msg.len()));
        }
        Ok(())
    }

    /** Receive one whole message into `buf`. Returns Ok(None) when the peer
     * has closed the connection. A peer message larger than `buf` is a
     * protocol violation and fails the call. */
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>, String> {
        loop {
            match socket::recv(
                self.socket.as_raw_fd(),
                buf,
                socket::MsgFlags::MSG_TRUNC,
            ) {
                Ok(0) => return Ok(None),
                Ok(n) if n > buf.len() => {
                    return Err(tag!(
                        "Message of {} bytes exceeds the {} byte receive buffer",
                        n,
                        buf.len()
                    ));
                }
                Ok(n) => return Ok(Some(n)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(tag!("Failed to read message: {}", e)),
            }
        }
    }

    /** Wait until a message (or EOF) is ready to be received. Returns
     * Ok(false) if `stop` was raised first. */
    pub fn wait_message(
        &self,
        pollmask: Option<&SigSet>,
        stop: &AtomicBool,
    ) -> Result<bool, String> {
        wait_readable(self.socket.as_fd(), pollmask, stop)
    }
}

#[cfg(test)]
fn temp_socket_path(label: &str) -> PathBuf {
    let mut rand = [0u8; 6];
    getrandom::getrandom(&mut rand).unwrap();
    let mut name = format!("hmdpipe-{}-", label);
    for b in rand {
        name.push_str(&format!("{:02x}", b));
    }
    std::env::temp_dir().join(name)
}

#[test]
fn framing_preserved() {
    let path = temp_socket_path("framing");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);

    /* Unix sockets complete connect once queued, before accept runs */
    let client = PipeConnection::connect(&path).unwrap();
    let server = endpoint.accept(None, &stop).unwrap().unwrap();

    client.send(&[1, 2, 3, 4]).unwrap();
    client.send(&[9]).unwrap();
    client.send(&[0; 600]).unwrap();

    let mut buf = [0u8; 1024];
    assert_eq!(server.receive(&mut buf).unwrap(), Some(4));
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(server.receive(&mut buf).unwrap(), Some(1));
    assert_eq!(buf[0], 9);
    assert_eq!(server.receive(&mut buf).unwrap(), Some(600));

    server.send(&[7, 7]).unwrap();
    assert_eq!(client.receive(&mut buf).unwrap(), Some(2));
}

#[test]
fn oversize_message_fails() {
    let path = temp_socket_path("oversize");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    let client = PipeConnection::connect(&path).unwrap();
    let server = endpoint.accept(None, &stop).unwrap().unwrap();

    client.send(&[0xab; 300]).unwrap();
    let mut small = [0u8; 100];
    assert!(server.receive(&mut small).is_err());
}

#[test]
fn eof_on_peer_close() {
    let path = temp_socket_path("eof");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    let client = PipeConnection::connect(&path).unwrap();
    let server = endpoint.accept(None, &stop).unwrap().unwrap();

    client.send(&[5, 6]).unwrap();
    drop(client);
    let mut buf = [0u8; 16];
    assert_eq!(server.receive(&mut buf).unwrap(), Some(2));
    assert_eq!(server.receive(&mut buf).unwrap(), None);
}

#[test]
fn stop_flag_interrupts_accept() {
    let path = temp_socket_path("stop");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(true);
    assert!(endpoint.accept(None, &stop).unwrap().is_none());
}
