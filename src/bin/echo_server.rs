//! Minimal TCP echo server exercising the accept/read/write path end to
//! end: bind a scheme, echo every inbound chunk back to its broker, and
//! log connect/close transitions. Run with `RUST_LOG=debug` for detail.
//!
//! Reads land on a `broker.on_read` callback that only gets `&[u8]` plus
//! the broker/scheme ids, not a handle back into the reactor, so inbound
//! chunks are queued here and flushed through `Node::send` from the main
//! loop between poll cycles instead of being echoed inline.

use std::collections::VecDeque;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use corewire::node::SendMode;
use corewire::scheme::{Family, Scheme};
use corewire::socket::Transport;
use corewire::ServerCore;

fn main() {
    env_logger::init();

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7007".to_string());
    let (host, port) = addr.rsplit_once(':').expect("usage: echo-server [host:port]");
    let port: u16 = port.parse().expect("port must be a u16");

    let mut core = ServerCore::new().expect("reactor init");
    let connections = Arc::new(AtomicUsize::new(0));
    let pending: Arc<Mutex<VecDeque<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(VecDeque::new()));

    core.on_accept(|peer, scheme_id| {
        log::info!("accept {peer} on scheme {scheme_id}");
        true
    });

    let c = connections.clone();
    core.on_connect(move |bid, scheme_id| {
        let active = c.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("connect bid={bid} scheme={scheme_id} (active={active})");
    });

    let queue = pending.clone();
    core.on_read(move |data, bid, _scheme_id| {
        queue.lock().unwrap().push_back((bid, data.to_vec()));
    });

    let c = connections.clone();
    core.on_close(move |bid, scheme_id| {
        let active = c.fetch_sub(1, Ordering::SeqCst) - 1;
        log::info!("close bid={bid} scheme={scheme_id} (active={active})");
    });

    let scheme = Scheme::new(Family::Ipv4, Transport::Tcp, host, port);
    let scheme_id = core.listen(scheme, None).expect("bind failed");
    log::info!("echo server listening on {addr} (scheme {scheme_id})");

    loop {
        core.run_once().expect("reactor poll");
        let mut drained = pending.lock().unwrap();
        while let Some((bid, data)) = drained.pop_front() {
            core.node.send(bid, &data, SendMode::Instant);
        }
    }
}
