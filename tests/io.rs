use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::clock;
use weft::hook;
use weft::net::{CoTcpListener, CoTcpStream};
use weft::reactor::{Event, Reactor};

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = clock::now_ms() + timeout.as_millis() as u64;
    while !cond() {
        assert!(clock::now_ms() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn hooked_sleep_takes_at_least_the_requested_time() {
    let reactor = Reactor::new(1, false, "io-sleep").unwrap();

    let elapsed = Arc::new(AtomicU64::new(0));
    {
        let elapsed = elapsed.clone();
        reactor.schedule(move || {
            let t0 = clock::now_ms();
            hook::sleep(1);
            elapsed.store(clock::now_ms() - t0, Ordering::SeqCst);
        });
    }

    wait_until("hooked sleep to return", Duration::from_secs(5), || {
        elapsed.load(Ordering::SeqCst) != 0
    });
    reactor.stop();

    let ms = elapsed.load(Ordering::SeqCst);
    assert!((1000..=1300).contains(&ms), "slept for {}ms", ms);
}

#[test]
fn sleeping_fibers_share_one_worker() {
    let reactor = Reactor::new(1, false, "io-sleep2").unwrap();

    let done = Arc::new(AtomicU32::new(0));
    let t0 = clock::now_ms();
    for _ in 0..2 {
        let done = done.clone();
        reactor.schedule(move || {
            hook::usleep(500_000);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    wait_until("both sleepers to finish", Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 2
    });
    let total = clock::now_ms() - t0;
    reactor.stop();

    // both fibers park on timers concurrently instead of serializing
    assert!(total < 900, "two 500ms sleeps took {}ms", total);
}

#[test]
fn echo_loop_serves_two_clients() {
    let reactor = Reactor::new(2, false, "io-echo").unwrap();

    let port = Arc::new(AtomicU32::new(0));
    {
        let port = port.clone();
        reactor.schedule(move || {
            let listener = CoTcpListener::bind("127.0.0.1:0").unwrap();
            port.store(
                listener.local_addr().unwrap().port() as u32,
                Ordering::SeqCst,
            );
            for _ in 0..2 {
                let (mut stream, _peer) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).unwrap();
                stream.write_all(&buf[..n]).unwrap();
            }
        });
    }

    wait_until("the echo listener to bind", Duration::from_secs(5), || {
        port.load(Ordering::SeqCst) != 0
    });
    let port = port.load(Ordering::SeqCst) as u16;

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            stream.write_all(b"hello world").unwrap();
            let mut buf = [0u8; 11];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello world");
        }));
    }
    for client in clients {
        client.join().unwrap();
    }
    reactor.stop();
}

#[test]
fn connect_to_a_non_routable_address_times_out() {
    let reactor = Reactor::new(1, false, "io-connect").unwrap();

    let outcome: Arc<Mutex<Option<(io::ErrorKind, u64)>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        reactor.schedule(move || {
            let addr: SocketAddr = "10.255.255.1:80".parse().unwrap();
            let t0 = clock::now_ms();
            let err = CoTcpStream::connect_timeout(&addr, Duration::from_millis(500))
                .expect_err("10.255.255.1 must not accept connections");
            *outcome.lock().unwrap() = Some((err.kind(), clock::now_ms() - t0));
        });
    }

    wait_until("the connect attempt to fail", Duration::from_secs(5), || {
        outcome.lock().unwrap().is_some()
    });
    reactor.stop();

    let (kind, ms) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(kind, io::ErrorKind::TimedOut);
    assert!((450..=900).contains(&ms), "connect failed after {}ms", ms);
}

#[test]
fn recurring_timer_fires_about_every_interval() {
    let reactor = Reactor::new(1, false, "io-recurring").unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let handle = {
        let hits = hits.clone();
        reactor.timers().add_timer(
            100,
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
    };

    std::thread::sleep(Duration::from_millis(1050));
    assert!(reactor.timers().cancel(&handle));

    // let a callback already in flight at cancel time land first
    std::thread::sleep(Duration::from_millis(250));
    let fired = hits.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(hits.load(Ordering::SeqCst), fired, "cancelled timer fired again");
    reactor.stop();

    assert!(
        (8..=12).contains(&fired),
        "100ms recurring timer fired {} times in ~1050ms",
        fired
    );
}

#[test]
fn condition_timer_skips_once_the_witness_is_gone() {
    let reactor = Reactor::new(1, false, "io-condtimer").unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let witness = Arc::new(());
    {
        let hits = hits.clone();
        reactor.timers().add_condition_timer(
            10,
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );
    }

    drop(witness);
    std::thread::sleep(Duration::from_millis(50));
    reactor.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_event_wakes_the_parked_fiber_without_data() {
    let reactor = Reactor::new(2, false, "io-cancel").unwrap();

    let (parked_end, other_end) = UnixStream::pair().unwrap();
    let fd = parked_end.as_raw_fd();

    let resumed = Arc::new(AtomicBool::new(false));
    {
        let reactor = reactor.clone();
        let resumed = resumed.clone();
        reactor.clone().schedule(move || {
            // keep the descriptor alive while parked on it
            let _parked_end = parked_end;
            reactor.add_event(fd, Event::READ, None).unwrap();
            weft::fiber::yield_to_hold();
            resumed.store(true, Ordering::SeqCst);
        });
    }

    wait_until("the fiber to park", Duration::from_secs(5), || {
        reactor.pending_events() == 1
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!resumed.load(Ordering::SeqCst), "woke up without any event");

    {
        let reactor = reactor.clone();
        reactor.clone().schedule(move || {
            assert!(reactor.cancel_event(fd, Event::READ));
        });
    }

    wait_until("the cancelled fiber to resume", Duration::from_secs(5), || {
        resumed.load(Ordering::SeqCst)
    });
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    drop(other_end);
}

#[test]
fn event_callback_parker_fires_on_readiness() {
    let reactor = Reactor::new(1, false, "io-cbparker").unwrap();

    let (read_end, mut write_end) = UnixStream::pair().unwrap();
    let fd = read_end.as_raw_fd();

    let fired = Arc::new(AtomicBool::new(false));
    {
        let reactor = reactor.clone();
        let fired = fired.clone();
        reactor.clone().schedule(move || {
            reactor
                .add_event(
                    fd,
                    Event::READ,
                    Some(Box::new(move || {
                        fired.store(true, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        });
    }

    wait_until("the callback to be parked", Duration::from_secs(5), || {
        reactor.pending_events() == 1
    });
    write_end.write_all(b"x").unwrap();

    wait_until("the callback to fire", Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst)
    });
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    drop(read_end);
}
