// src/syscalls.rs
use crate::error::{NocturneError, NocturneResult};
use libc::{c_int, c_void, socklen_t};
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;

// ---- Socket Operations ----

/// Resolve a listen address and create a bound, non-blocking TCP socket.
///
/// `listen_addr` starting with `*` selects a wildcard (passive) listener on
/// all interfaces. `port` may be a number or a service name. When the
/// resolver returns multiple entries the IPv6 one is preferred unless
/// `v4_only` is set.
pub fn create_listen_socket(listen_addr: &str, port: &str, v4_only: bool) -> NocturneResult<c_int> {
    let wildcard = listen_addr.starts_with('*');
    let node = if wildcard {
        None
    } else {
        Some(
            CString::new(listen_addr)
                .map_err(|_| NocturneError::AddrResolution("listen address contains NUL".into()))?,
        )
    };
    let service = CString::new(port)
        .map_err(|_| NocturneError::AddrResolution("port contains NUL".into()))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = if v4_only { libc::AF_INET } else { libc::AF_UNSPEC };
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;
    if wildcard {
        hints.ai_flags = libc::AI_PASSIVE;
    }

    let node_ptr = node.as_ref().map_or(ptr::null(), |c| c.as_ptr());
    let mut info: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node_ptr, service.as_ptr(), &hints, &mut info) };
    if rc != 0 {
        let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
            .to_string_lossy()
            .into_owned();
        return Err(NocturneError::AddrResolution(msg));
    }

    unsafe {
        // walk the result list, preferring the IPv6 entry
        let mut cur = info;
        while !(*cur).ai_next.is_null() && (*cur).ai_family != libc::AF_INET6 && !v4_only {
            cur = (*cur).ai_next;
        }

        let fd = match create_socket_fd((*cur).ai_family, (*cur).ai_socktype, (*cur).ai_protocol) {
            Ok(fd) => fd,
            Err(e) => {
                libc::freeaddrinfo(info);
                return Err(e);
            }
        };

        // avoid being locked out of the address for two minutes after restart
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if libc::bind(fd, (*cur).ai_addr, (*cur).ai_addrlen) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            libc::freeaddrinfo(info);
            return Err(err.into());
        }

        libc::freeaddrinfo(info);
        Ok(fd)
    }
}

fn create_socket_fd(family: c_int, socktype: c_int, protocol: c_int) -> NocturneResult<c_int> {
    #[cfg(target_os = "linux")]
    unsafe {
        // atomic non-blocking socket, saves the fcntl round-trip
        let fd = libc::socket(family, socktype | libc::SOCK_NONBLOCK, protocol);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let fd = libc::socket(family, socktype, protocol);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e.into());
        }

        // SO_NOSIGPIPE: macOS has no MSG_NOSIGNAL, suppress SIGPIPE per socket
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        Ok(fd)
    }
}

pub fn listen_socket(fd: c_int, backlog: c_int) -> NocturneResult<()> {
    unsafe {
        if libc::listen(fd, backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Accept one waiting connection, returning its fd and peer address.
///
/// Returns `Ok(None)` when the backlog is drained. EINTR and ECONNABORTED
/// are retried internally; any other error is fatal to the accept loop.
pub fn accept_connection(listen_fd: c_int) -> NocturneResult<Option<(c_int, String, u16)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    loop {
        #[cfg(target_os = "linux")]
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK,
            )
        };

        #[cfg(target_os = "macos")]
        let fd = unsafe {
            libc::accept(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            if err.kind() == io::ErrorKind::Interrupted
                || err.raw_os_error() == Some(libc::ECONNABORTED)
            {
                continue;
            }
            return Err(err.into());
        }

        #[cfg(target_os = "macos")]
        unsafe {
            if let Err(e) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(e.into());
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        let (ip, port) = peer_from_storage(&storage);
        return Ok(Some((fd, ip, port)));
    }
}

/// Textual IP and host-order port out of a sockaddr_storage.
pub fn peer_from_storage(storage: &libc::sockaddr_storage) -> (String, u16) {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            (
                Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()).to_string(),
                u16::from_be(addr.sin_port),
            )
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            (
                Ipv6Addr::from(addr.sin6_addr.s6_addr).to_string(),
                u16::from_be(addr.sin6_port),
            )
        }
        _ => (String::from("<unknown>"), 0),
    }
}

/// Port the socket is actually bound to (useful when binding port 0).
pub fn local_port(fd: c_int) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let rc =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(peer_from_storage(&storage).1)
}

#[allow(dead_code)]
fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ---- Raw I/O ----

pub fn read_fd(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn write_fd(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Send on a socket without raising SIGPIPE when the peer is gone.
pub fn send_fd(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };

    // accepted sockets carry SO_NOSIGPIPE on macOS
    #[cfg(target_os = "macos")]
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };

    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Block the calling thread until the descriptor is writable.
pub fn wait_writable(fd: c_int) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc > 0 {
            // POLLERR/POLLHUP surface as the real error on the next write
            return Ok(());
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Zero-copy file transfer ----

/// One sendfile round. `offset` is advanced by the bytes actually moved.
#[cfg(target_os = "linux")]
pub fn sendfile_chunk(
    socket_fd: c_int,
    file_fd: c_int,
    offset: &mut libc::off_t,
    remaining: usize,
) -> io::Result<usize> {
    let res = unsafe { libc::sendfile(socket_fd, file_fd, offset as *mut libc::off_t, remaining) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// One sendfile round. On EAGAIN the kernel may still have moved a partial
/// chunk, which is reflected in `offset` before the error is returned.
#[cfg(target_os = "macos")]
pub fn sendfile_chunk(
    socket_fd: c_int,
    file_fd: c_int,
    offset: &mut libc::off_t,
    remaining: usize,
) -> io::Result<usize> {
    let mut len: libc::off_t = remaining as libc::off_t;
    let rc = unsafe { libc::sendfile(file_fd, socket_fd, *offset, &mut len, ptr::null_mut(), 0) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        *offset += len;
        Err(err)
    } else {
        *offset += len;
        Ok(len as usize)
    }
}

// ---- Wakeup pipe ----

/// Non-blocking Unix pipe used to interrupt the poll loop. Returns
/// (read_fd, write_fd).
pub fn create_pipe() -> NocturneResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // only the read end sits inside the poll loop
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

// ---- Readiness multiplexer (Linux epoll) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};
    use libc::EPOLLET;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> NocturneResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        /// Watch a descriptor. Edge triggered; re-adding an already-ready
        /// descriptor reports its pending readiness.
        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> NocturneResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };

            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> NocturneResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Wait for readiness. Interrupted waits surface as errors so the
        /// caller can tell them apart from an idle timeout.
        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> NocturneResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );

                if res < 0 {
                    return Err(io::Error::last_os_error().into());
                }

                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Kqueue fallback for macOS development ----

#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> NocturneResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> NocturneResult<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> NocturneResult<()> {
            self.modify_kqueue(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn modify_kqueue(
            &self,
            fd: c_int,
            token: u64,
            interests: i32,
            action: u16,
        ) -> NocturneResult<()> {
            let mut changes = [unsafe { std::mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            unsafe {
                // deletes may target filters that were never added, ignore those
                let res = libc::kevent(
                    self.fd,
                    changes.as_ptr(),
                    n as c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                );

                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> NocturneResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { std::mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch_size = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };

            let ts_ptr = match &ts {
                Some(t) => t as *const timespec,
                None => ptr::null(),
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch_size as c_int,
                    ts_ptr,
                );

                if res < 0 {
                    return Err(io::Error::last_os_error().into());
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ep_ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ep_ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ep_ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ep_ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }

                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
