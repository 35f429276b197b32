// src/conn.rs
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::NocturneResult;
use crate::syscalls;

/// Largest number of bytes a single read task hands to the callback.
pub const READ_CHUNK: usize = 4095;

/// One accepted client connection.
///
/// Owned by the server's connection table from acceptance until closure and
/// shared with in-flight read tasks. The transport closes at most once; a
/// closed connection never reappears in the table.
pub struct Connection {
    id: u64,
    fd: libc::c_int,
    remote_ip: String,
    remote_port: u16,

    /// An outbound transfer is in progress; the idle sweep skips us.
    pub(crate) sending: AtomicBool,
    /// A read task is queued or running; readiness is not re-armed.
    pub(crate) busy: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: u64, fd: libc::c_int, remote_ip: String, remote_port: u16) -> Self {
        Self {
            id,
            fd,
            remote_ip,
            remote_port,
            sending: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Unique, monotonically increasing for the lifetime of the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Remote port in host byte order.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub(crate) fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub(crate) fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim the right to close the transport. Only the first caller gets
    /// `true` and may close the fd.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Write the whole buffer to the peer, blocking the calling thread on a
    /// writability wait whenever the socket buffer is full.
    ///
    /// Best-effort full delivery: a fatal socket error aborts the loop and
    /// leaves the unwritten tail undelivered.
    pub fn send_data(&self, data: &[u8]) -> NocturneResult<()> {
        let _guard = SendGuard::arm(&self.sending);

        let mut written = 0usize;
        while written < data.len() {
            match syscalls::send_fd(self.fd, &data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    syscalls::wait_writable(self.fd)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Stream a whole file to the peer with the platform's zero-copy
    /// primitive. Returns the number of bytes transferred.
    ///
    /// An unopenable file fails before the connection is marked as sending;
    /// the file handle closes on every exit path.
    pub fn send_file(&self, path: impl AsRef<Path>) -> NocturneResult<u64> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let _guard = SendGuard::arm(&self.sending);

        let mut offset: libc::off_t = 0;
        while (offset as u64) < file_size {
            let remaining = (file_size - offset as u64) as usize;
            match syscalls::sendfile_chunk(self.fd, file.as_raw_fd(), &mut offset, remaining) {
                // file truncated underneath us
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    syscalls::wait_writable(self.fd)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(offset as u64)
    }
}

/// Marks the connection as mid-send for the guard's lifetime, so an early
/// error return cannot leave the flag stuck and the idle sweep keeps its
/// hands off a connection that is still transmitting.
struct SendGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SendGuard<'a> {
    fn arm(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self { flag }
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_guard_clears_flag_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = SendGuard::arm(&flag);
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn close_claim_is_single_shot() {
        let conn = Connection::new(7, -1, "127.0.0.1".into(), 4567);
        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert!(conn.is_closed());
    }
}
