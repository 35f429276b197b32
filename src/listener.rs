// src/listener.rs
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::conn::{Connection, READ_CHUNK};
use crate::error::NocturneError;
use crate::queue::WorkQueue;
use crate::syscalls::{self, EPOLLIN, Epoll, epoll_event};
use crate::table::ConnectionTable;

pub(crate) const LISTEN_TOKEN: u64 = u64::MAX;
pub(crate) const WAKE_TOKEN: u64 = u64::MAX - 1;

const EVENT_BATCH: usize = 1024;

pub(crate) type ReceiveCallback = Box<dyn Fn(&Connection, &[u8]) -> bool + Send + Sync + 'static>;

/// State shared between the listener thread, the read tasks running on the
/// worker pool, and the `Server` handle.
pub(crate) struct Shared {
    pub listen_fd: libc::c_int,
    pub wake_rx: libc::c_int,
    pub idle_timeout: Duration,
    pub on_receive: ReceiveCallback,
    pub table: ConnectionTable,
    pub epoll: Epoll,
    pub next_id: AtomicU64,
    pub shutdown: AtomicBool,
}

impl Shared {
    /// Close a connection exactly once: deregister it, close the fd, drop
    /// it from the table. Safe to race from any thread.
    pub fn close_connection(&self, conn: &Connection) {
        if !conn.begin_close() {
            return;
        }
        self.epoll.delete(conn.fd()).ok();
        syscalls::close_fd(conn.fd());
        self.table.remove(conn.id());
    }
}

/// The event loop. One dedicated thread: accept new connections, poll all
/// open ones for readability, dispatch ready ones to the worker pool, and
/// evict idle ones when the poll times out.
pub(crate) fn run(shared: Arc<Shared>, queue: Arc<WorkQueue>) {
    let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
    let timeout_ms = shared
        .idle_timeout
        .as_millis()
        .clamp(1, i32::MAX as u128) as i32;

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let n = match shared.epoll.wait(&mut events, timeout_ms) {
            Ok(n) => n,
            Err(NocturneError::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("nocturne-listener: poll failed: {}", e);
                break;
            }
        };

        if n == 0 {
            // idle timeout: kick every connection not transmitting
            evict_idle(&shared);
            continue;
        }

        for ev in events.iter().take(n) {
            match ev.u64 {
                WAKE_TOKEN => {
                    let mut scratch = [0u8; 8];
                    let _ = syscalls::read_fd(shared.wake_rx, &mut scratch);
                }
                LISTEN_TOKEN => {
                    if !accept_ready(&shared) {
                        return;
                    }
                }
                token => dispatch(&shared, &queue, token),
            }
        }
    }
}

/// Drain the accept backlog. Returns false on a non-recoverable accept
/// error, which ends the event loop.
fn accept_ready(shared: &Shared) -> bool {
    loop {
        match syscalls::accept_connection(shared.listen_fd) {
            Ok(Some((fd, ip, port))) => {
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                let conn = Arc::new(Connection::new(id, fd, ip, port));
                shared.table.insert(conn.clone());
                if let Err(e) = shared.epoll.add(fd, id, EPOLLIN) {
                    eprintln!("nocturne-listener: cannot watch connection {}: {}", id, e);
                    shared.close_connection(&conn);
                }
            }
            Ok(None) => return true,
            Err(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    eprintln!("nocturne-listener: accept failed: {}", e);
                }
                return false;
            }
        }
    }
}

/// Hand a readable connection to the worker pool.
///
/// The connection is marked busy and deregistered from the poller before
/// the task is queued, so it cannot be re-dispatched until the task's
/// cleanup re-arms it. A stale token for an already-closed connection is
/// skipped.
fn dispatch(shared: &Arc<Shared>, queue: &Arc<WorkQueue>, token: u64) {
    let conn = match shared.table.find(token) {
        Some(conn) => conn,
        None => return,
    };
    if conn.busy.swap(true, Ordering::AcqRel) {
        return;
    }
    shared.epoll.delete(conn.fd()).ok();

    let task_shared = shared.clone();
    let task_conn = conn.clone();
    let cleanup_shared = shared.clone();
    let cleanup_conn = conn;

    queue.add_task_with_cleanup(
        move || read_task(&task_shared, &task_conn),
        move || {
            // re-arm readiness unless the task closed the connection
            cleanup_conn.busy.store(false, Ordering::Release);
            if !cleanup_conn.is_closed()
                && cleanup_shared
                    .epoll
                    .add(cleanup_conn.fd(), cleanup_conn.id(), EPOLLIN)
                    .is_err()
            {
                cleanup_shared.close_connection(&cleanup_conn);
            }
        },
    );
}

/// Worker-executed: read one chunk, invoke the receive callback, close the
/// connection on EOF, error, or a declined continuation.
fn read_task(shared: &Shared, conn: &Connection) {
    let mut buf = [0u8; READ_CHUNK];
    let n = loop {
        match syscalls::read_fd(conn.fd(), &mut buf) {
            // peer shut down
            Ok(0) => {
                shared.close_connection(conn);
                return;
            }
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // no data after all; cleanup re-arms readiness
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                eprintln!("nocturne: read error on connection {}: {}", conn.id(), e);
                shared.close_connection(conn);
                return;
            }
        }
    };

    if !(shared.on_receive)(conn, &buf[..n]) {
        shared.close_connection(conn);
    }
}

fn evict_idle(shared: &Shared) {
    for conn in shared.table.take_idle() {
        if conn.begin_close() {
            shared.epoll.delete(conn.fd()).ok();
            syscalls::close_fd(conn.fd());
        }
    }
}
