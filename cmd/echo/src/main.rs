//! strand Echo Server
//!
//! TCP echo server with one fiber per connection. Every accept, read and
//! write is a plain blocking-looking call that suspends only its fiber.
//!
//! Usage:
//!     cargo build --release -p strand-echo
//!     STRAND_NUM_THREADS=4 ./target/release/strand-echo [port] [idle_timeout_ms]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand::net::{TcpListener, TcpStream};
use strand::{kdebug, kerror, kinfo, spawn, Runtime, RuntimeConfig};

const BUF_SIZE: usize = 4096;

struct Stats {
    accepted: AtomicU64,
    bytes: AtomicU64,
}

fn serve(mut conn: TcpStream, peer: SocketAddr, stats: Arc<Stats>) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                kdebug!("{}: read: {}", peer, e);
                break;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]) {
            kdebug!("{}: write: {}", peer, e);
            break;
        }
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
    kdebug!("{}: closed", peer);
}

fn accept_loop(addr: SocketAddr, idle_timeout: Option<Duration>, stats: Arc<Stats>) {
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            kerror!("bind {}: {}", addr, e);
            return;
        }
    };
    kinfo!("listening on {}", addr);

    loop {
        let (conn, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                kerror!("accept: {}", e);
                continue;
            }
        };
        let total = stats.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        kdebug!("accepted {} (#{})", peer, total);
        if let Err(e) = conn.set_read_timeout(idle_timeout) {
            kerror!("{}: set_read_timeout: {}", peer, e);
        }
        let stats = stats.clone();
        if let Err(e) = spawn(move || serve(conn, peer, stats)) {
            kerror!("spawn for {}: {}", peer, e);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let idle_timeout = args
        .get(2)
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis);

    let config = RuntimeConfig::from_env().use_caller(false);
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats { accepted: AtomicU64::new(0), bytes: AtomicU64::new(0) });
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let s = stats.clone();
    if let Err(e) = runtime.spawn(move || accept_loop(addr, idle_timeout, s)) {
        eprintln!("failed to spawn acceptor: {}", e);
        std::process::exit(1);
    }

    // The acceptor keeps the reactor busy; report until killed.
    loop {
        std::thread::sleep(Duration::from_secs(10));
        kinfo!(
            "connections: {}, bytes echoed: {}",
            stats.accepted.load(Ordering::Relaxed),
            stats.bytes.load(Ordering::Relaxed)
        );
    }
}
