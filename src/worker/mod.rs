//! Worker runtime
//!
//! One OS thread per worker, each with a single-threaded tokio runtime and a
//! `LocalSet`. Every worker binds its own `SO_REUSEPORT` listener per
//! configured address, so the kernel spreads clients without any cross-worker
//! coordination. Per-worker hot state (buffer pool, counter cache) never
//! leaves its thread; only the shared status region crosses.

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::connection;
use crate::sendq::SendStats;
use crate::status::Status;
use crate::stream::StreamSettings;
use crate::web;
use log::{debug, error, info};
use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::LocalSet;

/// Per-worker shared state handed to every connection task.
pub struct WorkerState {
    pub id: usize,
    pub config: Arc<Config>,
    pub status: Arc<Status>,
    pub pool: BufferPool,
    pub settings: StreamSettings,
    pub zerocopy: bool,
    pub stop: watch::Receiver<bool>,
    send_totals: Cell<SendStats>,
}

impl WorkerState {
    pub fn new(
        id: usize,
        config: Arc<Config>,
        status: Arc<Status>,
        stop: watch::Receiver<bool>,
    ) -> io::Result<Rc<WorkerState>> {
        let settings = StreamSettings::from_config(&config)?;
        Ok(Rc::new(WorkerState {
            id,
            zerocopy: config.buffers.zerocopy,
            pool: BufferPool::new(config.buffers.pool_config()),
            settings,
            config,
            status,
            stop,
            send_totals: Cell::new(SendStats::default()),
        }))
    }

    pub fn add_send_stats(&self, delta: SendStats) {
        let mut totals = self.send_totals.get();
        totals.accumulate(&delta);
        self.send_totals.set(totals);
    }

    pub fn send_totals(&self) -> SendStats {
        self.send_totals.get()
    }
}

fn gettid() -> i32 {
    unsafe { libc::gettid() as i32 }
}

/// Spawn all worker threads. Listeners are pre-bound by the caller so bind
/// errors surface before any thread starts.
pub fn spawn_workers(
    config: Arc<Config>,
    status: Arc<Status>,
    listeners: Vec<Vec<std::net::TcpListener>>,
    stop: watch::Receiver<bool>,
) -> Vec<std::thread::JoinHandle<()>> {
    listeners
        .into_iter()
        .enumerate()
        .map(|(id, listeners)| {
            let config = Arc::clone(&config);
            let status = Arc::clone(&status);
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_main(id, config, status, listeners, stop))
                .expect("spawn worker thread")
        })
        .collect()
}

fn worker_main(
    id: usize,
    config: Arc<Config>,
    status: Arc<Status>,
    listeners: Vec<std::net::TcpListener>,
    stop: watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("worker {}: cannot build runtime: {}", id, e);
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        if let Err(e) = worker_loop(id, config, status, listeners, stop).await {
            error!("worker {}: {}", id, e);
        }
    });
}

async fn worker_loop(
    id: usize,
    config: Arc<Config>,
    status: Arc<Status>,
    listeners: Vec<std::net::TcpListener>,
    stop: watch::Receiver<bool>,
) -> io::Result<()> {
    let state = WorkerState::new(id, config, status, stop.clone())?;
    info!("worker {} up (tid {})", id, gettid());

    // Periodic publication of this worker's counters, plus pool shrink and
    // the SSE heartbeat (worker 0 only, once for the whole process).
    {
        let state = Rc::clone(&state);
        let mut stop = stop.clone();
        tokio::task::spawn_local(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stop.changed() => break,
                }
                state.pool.try_shrink();
                state.status.publish_worker(
                    state.id,
                    gettid(),
                    state.send_totals(),
                    state.pool.stats(),
                );
                if state.id == 0 {
                    web::heartbeat(&state.status);
                }
            }
        });
    }

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let state = Rc::clone(&state);
        let mut stop = stop.clone();
        accept_tasks.push(tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer)) => {
                                socket.set_nodelay(true).ok();
                                debug!("worker {}: accepted {}", state.id, peer);
                                let state = Rc::clone(&state);
                                tokio::task::spawn_local(async move {
                                    connection::handle_connection(socket, peer, state).await;
                                });
                            }
                            Err(e) => {
                                // Transient accept errors (EMFILE bursts
                                // etc.) must not kill the worker.
                                debug!("worker {}: accept failed: {}", state.id, e);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));
    }

    for task in accept_tasks {
        let _ = task.await;
    }
    info!("worker {} stopping", id);
    Ok(())
}
