//! Cooperative TCP echo server: one accept fiber, one fiber per
//! connection.
//!
//! Run with `cargo run --example echo_server`, then poke it:
//! `cargo run --example echo_client` (or `nc 127.0.0.1 8020`).

use std::io::{Read, Write};

use weft::net::CoTcpListener;
use weft::reactor::Reactor;

fn main() {
    let reactor = Reactor::new(2, false, "echo").expect("reactor");

    let r = reactor.clone();
    reactor.schedule(move || {
        let listener = CoTcpListener::bind("0.0.0.0:8020").expect("bind 0.0.0.0:8020");
        println!("echo server listening on {}", listener.local_addr().unwrap());

        loop {
            let (mut stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("accept failed: {}", e);
                    continue;
                }
            };
            println!("client connected: {}", peer);
            r.schedule(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            eprintln!("client {} dropped: {}", peer, e);
                            break;
                        }
                    }
                }
            });
        }
    });

    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
