// demos/echo.rs
//
// Echo server: prints whatever a client sends and mirrors it back.
// Try it with `nc localhost 4567`.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nocturne::Server;

fn main() {
    println!("Initializing server...");
    let mut server = Server::init("*", "4567", false, Duration::from_secs(10))
        .expect("unable to initialize server");

    server
        .start(
            |conn, data| {
                println!(
                    "[{}] {}:{}: {}",
                    conn.id(),
                    conn.remote_ip(),
                    conn.remote_port(),
                    String::from_utf8_lossy(data).trim_end()
                );
                conn.send_data(data).is_ok()
            },
            0, // one worker per core
        )
        .expect("unable to listen on socket");

    println!("Ready to accept connections on *:4567...");

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived SIGINT. Shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    server.stop();
}
