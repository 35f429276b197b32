// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::conn::Connection;
use crate::error::{NocturneError, NocturneResult};
use crate::listener::{self, LISTEN_TOKEN, Shared, WAKE_TOKEN};
use crate::queue::WorkQueue;
use crate::syscalls::{self, EPOLLIN, Epoll};
use crate::table::ConnectionTable;

const LISTEN_BACKLOG: libc::c_int = 20;

/// The embeddable TCP server.
///
/// `init` resolves and binds the listening socket, `start` brings up the
/// worker pool and the event-loop thread, `stop` consumes the handle and
/// tears everything down, so a stopped server cannot be reused by mistake.
pub struct Server {
    listen_fd: libc::c_int,
    idle_timeout: Duration,
    shared: Option<Arc<Shared>>,
    queue: Option<Arc<WorkQueue>>,
    listener: Option<JoinHandle<()>>,
    wake_tx: libc::c_int,
}

impl Server {
    /// Resolve `listen_addr` (use `"*"` for all interfaces) and bind a
    /// listening socket. `port` may be a number or a service name.
    /// Connections that stay silent for `idle_timeout` get closed.
    pub fn init(
        listen_addr: &str,
        port: &str,
        v4_only: bool,
        idle_timeout: Duration,
    ) -> NocturneResult<Server> {
        let listen_fd = syscalls::create_listen_socket(listen_addr, port, v4_only)?;
        Ok(Server {
            listen_fd,
            idle_timeout,
            shared: None,
            queue: None,
            listener: None,
            wake_tx: -1,
        })
    }

    /// Start listening and dispatching.
    ///
    /// `on_receive` runs on a worker thread for every chunk of data a
    /// client sends; return `false` to have the server close that
    /// connection. `worker_count == 0` means one worker per CPU core.
    pub fn start<F>(&mut self, on_receive: F, worker_count: usize) -> NocturneResult<()>
    where
        F: Fn(&Connection, &[u8]) -> bool + Send + Sync + 'static,
    {
        if self.shared.is_some() {
            return Err(NocturneError::AlreadyRunning);
        }

        syscalls::listen_socket(self.listen_fd, LISTEN_BACKLOG)?;

        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        let epoll = match Epoll::new() {
            Ok(epoll) => epoll,
            Err(e) => {
                syscalls::close_fd(wake_rx);
                syscalls::close_fd(wake_tx);
                return Err(e);
            }
        };
        if let Err(e) = epoll
            .add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)
            .and_then(|_| epoll.add(wake_rx, WAKE_TOKEN, EPOLLIN))
        {
            syscalls::close_fd(wake_rx);
            syscalls::close_fd(wake_tx);
            return Err(e);
        }

        let workers = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        };
        let queue = Arc::new(WorkQueue::new(workers));
        queue.resume();

        let shared = Arc::new(Shared {
            listen_fd: self.listen_fd,
            wake_rx,
            idle_timeout: self.idle_timeout,
            on_receive: Box::new(on_receive),
            table: ConnectionTable::new(),
            epoll,
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let thread_queue = queue.clone();
        let handle = match thread::Builder::new()
            .name("nocturne-listener".to_string())
            .spawn(move || listener::run(thread_shared, thread_queue))
        {
            Ok(handle) => handle,
            Err(e) => {
                syscalls::close_fd(wake_rx);
                syscalls::close_fd(wake_tx);
                return Err(e.into());
            }
        };

        self.shared = Some(shared);
        self.queue = Some(queue);
        self.listener = Some(handle);
        self.wake_tx = wake_tx;

        println!("nocturne: listening with {} workers", workers);
        Ok(())
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.table.len())
    }

    /// Port the listening socket is actually bound to.
    pub fn local_port(&self) -> NocturneResult<u16> {
        Ok(syscalls::local_port(self.listen_fd)?)
    }

    /// Shut the server down: stop accepting, join the event loop, drain
    /// and destroy the worker pool, close every remaining connection.
    pub fn stop(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.shutdown.store(true, Ordering::Release);
            let _ = syscalls::write_fd(self.wake_tx, &[1]);

            if let Some(handle) = self.listener.take() {
                let _ = handle.join();
            }

            if let Some(queue) = self.queue.take() {
                // the listener is joined, so this is the only handle left
                if let Ok(queue) = Arc::try_unwrap(queue) {
                    let mut queue = queue;
                    // let in-flight read tasks finish instead of forcing
                    loop {
                        match queue.destroy() {
                            Ok(()) => break,
                            Err(q) => {
                                queue = q;
                                thread::sleep(Duration::from_millis(5));
                            }
                        }
                    }
                }
            }

            // whatever the read tasks left open goes now
            for conn in shared.table.drain() {
                if conn.begin_close() {
                    shared.epoll.delete(conn.fd()).ok();
                    syscalls::close_fd(conn.fd());
                }
            }

            syscalls::close_fd(shared.wake_rx);
            syscalls::close_fd(self.wake_tx);
            self.wake_tx = -1;
            println!("nocturne: server shut down");
        }

        if self.listen_fd >= 0 {
            syscalls::close_fd(self.listen_fd);
            self.listen_fd = -1;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}
