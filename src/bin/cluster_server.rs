//! Prefork cluster demo: the master binds one listening socket, forks a
//! pool of workers that all `accept()` on the inherited fd, and restarts
//! any worker that dies. Each worker is a plain blocking TCP echo loop —
//! cluster workers don't need the reactor, they just need their share of
//! the listening socket.

use std::env;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use corewire::cluster::WorkerContext;
use corewire::{ClusterEvent, ClusterSupervisor};

fn main() {
    env_logger::init();

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7008".to_string());
    let workers: usize = env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let listener = TcpListener::bind(&addr).expect("bind failed");
    log::info!("cluster master listening on {addr}, requesting {workers} workers");

    let mut supervisor = ClusterSupervisor::new();
    let scheme_id = 1;
    let clamped = supervisor.init(scheme_id, workers);
    if clamped != workers {
        log::warn!("worker count clamped from {workers} to {clamped}");
    }
    supervisor.set_auto_restart(scheme_id, true);

    supervisor
        .start(scheme_id, &listener, worker_main)
        .expect("fork workers");

    loop {
        for event in supervisor.poll_events(worker_main) {
            match event {
                ClusterEvent::Exit { scheme_id, pid, status } => {
                    log::warn!("worker exited scheme={scheme_id} pid={pid} status={status}");
                }
                ClusterEvent::Rebase {
                    scheme_id,
                    new_pid,
                    old_pid,
                } => {
                    log::info!("worker rebased scheme={scheme_id} old_pid={old_pid} new_pid={new_pid}");
                }
                ClusterEvent::Message { scheme_id, pid, data } => {
                    log::debug!("ipc message scheme={scheme_id} pid={pid} bytes={}", data.len());
                }
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Runs inside a forked worker: blocking-accept loop on the inherited
/// listener, echoing every connection back to its sender.
fn worker_main(ctx: WorkerContext) {
    let listener = ctx.listener.expect("cluster worker missing shared listener");
    let pid = std::process::id();
    log::info!("worker {pid} ready (scheme {})", ctx.scheme_id);

    for incoming in listener.incoming() {
        let Ok(mut stream) = incoming else { continue };
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
