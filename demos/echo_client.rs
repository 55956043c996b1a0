//! Sends one line to the echo server and prints what comes back.

use std::io::{Read, Write};
use std::sync::mpsc;

use weft::net::CoTcpStream;
use weft::reactor::Reactor;

fn main() {
    let reactor = Reactor::new(1, false, "echo-client").expect("reactor");

    let (tx, rx) = mpsc::channel();
    reactor.schedule(move || {
        let result = || -> std::io::Result<String> {
            let mut stream = CoTcpStream::connect("127.0.0.1:8020")?;
            stream.write_all(b"hello world")?;
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
        }();
        tx.send(result).ok();
    });

    match rx.recv().expect("client fiber died") {
        Ok(echo) => println!("server echoed: {:?}", echo),
        Err(e) => eprintln!("echo failed: {}", e),
    }
    reactor.stop();
}
