//! Shared status state
//!
//! One `Status` instance is shared by every worker. Worker counters are
//! plain atomics with a single writer each; the client-slot table takes a
//! mutex only while a slot is being claimed or released; the log ring tees
//! every emitted log record for the web UI. Cross-worker notifications
//! (SSE updates, disconnect requests) fan out over a broadcast channel and
//! are best-effort and idempotent.

use crate::buffer::PoolStats;
use crate::sendq::SendStats;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

pub const MAX_WORKERS: usize = 32;
pub const MAX_CLIENT_SLOTS: usize = 256;
pub const LOG_RING_SIZE: usize = 100;
pub const LOG_MSG_MAX: usize = 1024;

/// Events fanned out to every worker and SSE subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Clients,
    Workers,
    Log,
    LogLevel,
    Heartbeat,
    DisconnectRequest(u32),
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Default)]
pub struct WorkerSlot {
    pub tid: AtomicI32,
    pub active_clients: AtomicU64,
    pub send_total: AtomicU64,
    pub send_completions: AtomicU64,
    pub send_copied: AtomicU64,
    pub send_eagain: AtomicU64,
    pub send_enobufs: AtomicU64,
    pub send_batch: AtomicU64,
    pub pool_total: AtomicU64,
    pub pool_free: AtomicU64,
    pub pool_used: AtomicU64,
    pub pool_max: AtomicU64,
    pub pool_expansions: AtomicU64,
    pub pool_exhaustions: AtomicU64,
    pub pool_shrinks: AtomicU64,
}

#[derive(Default)]
pub struct ClientSlot {
    active: AtomicBool,
    client_id: AtomicU32,
    worker: AtomicU32,
    connected_at_ms: AtomicI64,
    bytes_sent: AtomicU64,
    bandwidth_bps: AtomicU64,
    disconnect_requested: AtomicBool,
    peer: Mutex<String>,
    url: Mutex<String>,
    state: Mutex<String>,
}

struct LogEntry {
    timestamp_ms: i64,
    level: i32,
    message: String,
}

struct LogRing {
    entries: Vec<LogEntry>,
    write_index: usize,
    count: usize,
}

pub struct Status {
    start_time_ms: i64,
    started: Instant,
    log_level: AtomicI32,
    next_client_id: AtomicU32,
    num_workers: usize,
    max_clients: usize,
    workers: Vec<WorkerSlot>,
    clients: Vec<ClientSlot>,
    /// Held only while claiming or releasing a slot.
    slot_lock: Mutex<()>,
    log_ring: Mutex<LogRing>,
    events: broadcast::Sender<StatusEvent>,
}

impl Status {
    pub fn new(num_workers: usize, max_clients: usize) -> Arc<Status> {
        let num_workers = num_workers.min(MAX_WORKERS);
        let max_clients = max_clients.min(MAX_CLIENT_SLOTS);
        let (events, _) = broadcast::channel(256);
        let mut workers = Vec::with_capacity(MAX_WORKERS);
        workers.resize_with(MAX_WORKERS, WorkerSlot::default);
        let mut clients = Vec::with_capacity(MAX_CLIENT_SLOTS);
        clients.resize_with(MAX_CLIENT_SLOTS, ClientSlot::default);
        Arc::new(Status {
            start_time_ms: now_ms(),
            started: Instant::now(),
            log_level: AtomicI32::new(2),
            next_client_id: AtomicU32::new(1),
            num_workers,
            max_clients,
            workers,
            clients,
            slot_lock: Mutex::new(()),
            log_ring: Mutex::new(LogRing {
                entries: Vec::with_capacity(LOG_RING_SIZE),
                write_index: 0,
                count: 0,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn notify(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn uptime_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    // ---- log level ----

    pub fn log_level(&self) -> i32 {
        self.log_level.load(Ordering::Relaxed)
    }

    /// Apply a new log level (0=error .. 4=trace) process-wide.
    pub fn set_log_level(&self, level: i32) {
        let level = level.clamp(0, 4);
        self.log_level.store(level, Ordering::Relaxed);
        log::set_max_level(level_filter(level));
        self.notify(StatusEvent::LogLevel);
    }

    // ---- log ring ----

    pub fn push_log(&self, level: i32, message: &str) {
        let entry = LogEntry {
            timestamp_ms: now_ms(),
            level,
            message: truncate_message(message),
        };
        {
            let mut ring = self.log_ring.lock();
            if ring.entries.len() < LOG_RING_SIZE {
                ring.entries.push(entry);
            } else {
                let idx = ring.write_index;
                ring.entries[idx] = entry;
            }
            ring.write_index = (ring.write_index + 1) % LOG_RING_SIZE;
            ring.count = (ring.count + 1).min(LOG_RING_SIZE);
        }
        self.notify(StatusEvent::Log);
    }

    // ---- worker stats ----

    /// Publish a worker's counters. Single writer per slot; readers may see
    /// briefly stale values, never torn ones. The active-client gauge is
    /// maintained by slot registration, not here.
    pub fn publish_worker(&self, worker: usize, tid: i32, send: SendStats, pool: PoolStats) {
        if worker >= MAX_WORKERS {
            return;
        }
        let slot = &self.workers[worker];
        slot.tid.store(tid, Ordering::Relaxed);
        slot.send_total.store(send.total, Ordering::Relaxed);
        slot.send_completions.store(send.completions, Ordering::Relaxed);
        slot.send_copied.store(send.copied, Ordering::Relaxed);
        slot.send_eagain.store(send.eagain, Ordering::Relaxed);
        slot.send_enobufs.store(send.enobufs, Ordering::Relaxed);
        slot.send_batch.store(send.batch, Ordering::Relaxed);
        slot.pool_total.store(pool.total as u64, Ordering::Relaxed);
        slot.pool_free.store(pool.free as u64, Ordering::Relaxed);
        slot.pool_used.store(pool.used as u64, Ordering::Relaxed);
        slot.pool_max.store(pool.max as u64, Ordering::Relaxed);
        slot.pool_expansions.store(pool.expansions, Ordering::Relaxed);
        slot.pool_exhaustions.store(pool.exhaustions, Ordering::Relaxed);
        slot.pool_shrinks.store(pool.shrinks, Ordering::Relaxed);
        self.notify(StatusEvent::Workers);
    }

    // ---- client slots ----

    /// Claim a slot for a new client. `None` when the table is full.
    pub fn register_client(
        self: &Arc<Status>,
        worker: usize,
        peer: &str,
        url: &str,
    ) -> Option<ClientHandle> {
        let _guard = self.slot_lock.lock();
        let active_now = self
            .clients
            .iter()
            .filter(|c| c.active.load(Ordering::Relaxed))
            .count();
        if active_now >= self.max_clients {
            return None;
        }
        let slot_idx = self
            .clients
            .iter()
            .position(|c| !c.active.load(Ordering::Relaxed))?;
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let slot = &self.clients[slot_idx];
        slot.client_id.store(id, Ordering::Relaxed);
        slot.worker.store(worker as u32, Ordering::Relaxed);
        slot.connected_at_ms.store(now_ms(), Ordering::Relaxed);
        slot.bytes_sent.store(0, Ordering::Relaxed);
        slot.bandwidth_bps.store(0, Ordering::Relaxed);
        slot.disconnect_requested.store(false, Ordering::Relaxed);
        *slot.peer.lock() = peer.to_string();
        *slot.url.lock() = url.to_string();
        *slot.state.lock() = "connected".to_string();
        slot.active.store(true, Ordering::Relaxed);
        drop(_guard);

        self.workers[worker.min(MAX_WORKERS - 1)]
            .active_clients
            .fetch_add(1, Ordering::Relaxed);
        self.notify(StatusEvent::Clients);
        Some(ClientHandle { status: Arc::clone(self), slot: slot_idx, id, worker })
    }

    /// Flag a client for disconnection; its owning worker acts on the next
    /// tick. Returns whether the id was found.
    pub fn request_disconnect(&self, client_id: u32) -> bool {
        let found = self.clients.iter().any(|c| {
            if c.active.load(Ordering::Relaxed) && c.client_id.load(Ordering::Relaxed) == client_id
            {
                c.disconnect_requested.store(true, Ordering::Relaxed);
                true
            } else {
                false
            }
        });
        if found {
            self.notify(StatusEvent::DisconnectRequest(client_id));
        }
        found
    }

    pub fn total_clients(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| c.active.load(Ordering::Relaxed))
            .count()
    }

    // ---- snapshot ----

    pub fn snapshot(&self) -> StatusSnapshot {
        let clients: Vec<ClientInfo> = self
            .clients
            .iter()
            .filter(|c| c.active.load(Ordering::Relaxed))
            .map(|c| ClientInfo {
                id: c.client_id.load(Ordering::Relaxed),
                worker_id: c.worker.load(Ordering::Relaxed),
                peer: c.peer.lock().clone(),
                url: c.url.lock().clone(),
                state: c.state.lock().clone(),
                bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
                bandwidth: c.bandwidth_bps.load(Ordering::Relaxed),
                connected_at: c.connected_at_ms.load(Ordering::Relaxed),
            })
            .collect();

        let workers: Vec<WorkerInfo> = (0..self.num_workers)
            .map(|i| {
                let w = &self.workers[i];
                let total = w.pool_total.load(Ordering::Relaxed);
                let used = w.pool_used.load(Ordering::Relaxed);
                WorkerInfo {
                    id: i,
                    pid: w.tid.load(Ordering::Relaxed),
                    active_clients: w.active_clients.load(Ordering::Relaxed),
                    send: SendInfo {
                        total: w.send_total.load(Ordering::Relaxed),
                        completions: w.send_completions.load(Ordering::Relaxed),
                        copied: w.send_copied.load(Ordering::Relaxed),
                        eagain: w.send_eagain.load(Ordering::Relaxed),
                        enobufs: w.send_enobufs.load(Ordering::Relaxed),
                        batch: w.send_batch.load(Ordering::Relaxed),
                    },
                    pool: PoolInfo {
                        total,
                        free: w.pool_free.load(Ordering::Relaxed),
                        used,
                        max: w.pool_max.load(Ordering::Relaxed),
                        expansions: w.pool_expansions.load(Ordering::Relaxed),
                        exhaustions: w.pool_exhaustions.load(Ordering::Relaxed),
                        shrinks: w.pool_shrinks.load(Ordering::Relaxed),
                        utilization: if total > 0 {
                            used as f64 / total as f64
                        } else {
                            0.0
                        },
                    },
                }
            })
            .collect();

        // Snapshot the ring oldest-first. Readers bound themselves to the
        // observed count and tolerate a stale tail.
        let logs = {
            let ring = self.log_ring.lock();
            let mut logs = Vec::with_capacity(ring.count);
            let len = ring.entries.len();
            if len > 0 {
                let start = if ring.count < LOG_RING_SIZE { 0 } else { ring.write_index };
                for i in 0..ring.count {
                    let e = &ring.entries[(start + i) % len];
                    logs.push(LogInfo {
                        timestamp_ms: e.timestamp_ms,
                        level: e.level,
                        message: e.message.clone(),
                    });
                }
            }
            logs
        };

        let total_clients = clients.len();
        StatusSnapshot {
            server_start_time: self.start_time_ms,
            uptime_ms: self.uptime_ms(),
            current_log_level: self.log_level(),
            version: env!("CARGO_PKG_VERSION"),
            max_clients: self.max_clients,
            clients,
            total_clients,
            workers,
            logs_mode: "full",
            logs,
        }
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= LOG_MSG_MAX {
        return message.to_string();
    }
    let mut end = LOG_MSG_MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// RAII registration of a streaming client in the shared table.
pub struct ClientHandle {
    status: Arc<Status>,
    slot: usize,
    id: u32,
    worker: usize,
}

impl ClientHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn slot(&self) -> &ClientSlot {
        &self.status.clients[self.slot]
    }

    pub fn set_state(&self, state: &str) {
        *self.slot().state.lock() = state.to_string();
        self.status.notify(StatusEvent::Clients);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.slot().bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.slot().bytes_sent.load(Ordering::Relaxed)
    }

    pub fn set_bandwidth(&self, bps: u64) {
        self.slot().bandwidth_bps.store(bps, Ordering::Relaxed);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.slot().disconnect_requested.load(Ordering::Relaxed)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let _guard = self.status.slot_lock.lock();
        self.slot().active.store(false, Ordering::Relaxed);
        drop(_guard);
        self.status.workers[self.worker.min(MAX_WORKERS - 1)]
            .active_clients
            .fetch_sub(1, Ordering::Relaxed);
        self.status.notify(StatusEvent::Clients);
    }
}

// ---- JSON shapes (S5 schema) ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub server_start_time: i64,
    pub uptime_ms: i64,
    pub current_log_level: i32,
    pub version: &'static str,
    pub max_clients: usize,
    pub clients: Vec<ClientInfo>,
    pub total_clients: usize,
    pub workers: Vec<WorkerInfo>,
    pub logs_mode: &'static str,
    pub logs: Vec<LogInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: u32,
    pub worker_id: u32,
    pub peer: String,
    pub url: String,
    pub state: String,
    pub bytes_sent: u64,
    pub bandwidth: u64,
    pub connected_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: usize,
    pub pid: i32,
    pub active_clients: u64,
    pub send: SendInfo,
    pub pool: PoolInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInfo {
    pub total: u64,
    pub completions: u64,
    pub copied: u64,
    pub eagain: u64,
    pub enobufs: u64,
    pub batch: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInfo {
    pub timestamp_ms: i64,
    pub level: i32,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub max: u64,
    pub expansions: u64,
    pub exhaustions: u64,
    pub shrinks: u64,
    pub utilization: f64,
}

// ---- logging tee ----

static STATUS_SINK: OnceLock<Arc<Status>> = OnceLock::new();

pub fn level_filter(level: i32) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn level_index(level: log::Level) -> i32 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

struct TeeLogger {
    inner: env_logger::Logger,
}

impl log::Log for TeeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Some(status) = STATUS_SINK.get() {
                status.push_log(level_index(record.level()), &record.args().to_string());
            }
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install env_logger behind the status tee. Safe to call once at startup.
pub fn init_logging(level: i32) {
    let inner = env_logger::Builder::from_default_env()
        .filter_level(level_filter(level))
        .build();
    if log::set_boxed_logger(Box::new(TeeLogger { inner })).is_ok() {
        log::set_max_level(level_filter(level));
    }
}

/// Point the logging tee at the shared status region.
pub fn attach_logging(status: Arc<Status>) {
    let _ = STATUS_SINK.set(status);
}
