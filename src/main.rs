//! tsgate - Main entry point

use clap::Parser;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tsgate::args::Args;
use tsgate::{net, status, worker};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    // Async-signal-safe: set the flag and nothing else.
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        // All writes go through error-returning sends; a broken pipe must
        // not kill the process.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() {
    let args = Args::parse();
    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tsgate: {}", e);
            std::process::exit(2);
        }
    };

    status::init_logging(config.logging.level);

    let workers = config.worker_count();
    let shared = status::Status::new(workers, config.server.maxclients);
    shared.set_log_level(config.logging.level);
    status::attach_logging(Arc::clone(&shared));

    info!(
        "tsgate {} starting: {} worker(s), {} service(s), maxclients {}",
        env!("CARGO_PKG_VERSION"),
        workers,
        config.services.len(),
        config.server.maxclients
    );

    // Bind every worker's reuseport listeners up front so address errors
    // surface here, not inside a worker thread.
    let mut listeners = Vec::with_capacity(workers);
    for _ in 0..workers {
        let mut per_worker = Vec::with_capacity(config.server.bind.len());
        for addr in &config.server.bind {
            let parsed = match addr.parse() {
                Ok(a) => a,
                Err(_) => {
                    eprintln!("tsgate: invalid bind address {}", addr);
                    std::process::exit(2);
                }
            };
            match net::reuseport_listener(parsed) {
                Ok(l) => per_worker.push(l),
                Err(e) => {
                    eprintln!("tsgate: cannot bind {}: {}", addr, e);
                    std::process::exit(1);
                }
            }
        }
        listeners.push(per_worker);
    }
    for addr in &config.server.bind {
        info!("listening on http://{}", addr);
    }

    install_signal_handlers();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let config = Arc::new(config);
    let handles = worker::spawn_workers(
        Arc::clone(&config),
        Arc::clone(&shared),
        listeners,
        stop_rx,
    );

    // Signal handlers may only set a flag; translate it to the watch
    // channel the workers select on.
    while !STOP_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("stop requested, draining workers");
    let _ = stop_tx.send(true);

    for handle in handles {
        if handle.join().is_err() {
            error!("a worker panicked during shutdown");
        }
    }
    info!("bye");
}
