use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

/// Shared build counters. Cheap to clone; every clone observes the same
/// values. With `enabled`, [`Progress::start`] logs a status line every few
/// seconds until [`Progress::stop`].
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    stage: Arc<Mutex<String>>,
    pub files_done: Arc<AtomicU64>,
    pub files_total: Arc<AtomicU64>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    pub blocks_hashed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicU64::new(0)),
            files_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            blocks_hashed: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if let Ok(mut stage) = self.stage.lock() {
            *stage = s.to_string();
        }
    }

    pub fn stage(&self) -> String {
        self.stage.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn reset_files(&self, total: u64, bytes: u64) {
        self.files_total.store(total, Ordering::Relaxed);
        self.files_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
    }

    pub fn inc_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_block(&self) {
        self.blocks_hashed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled || self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let this = self.clone();
        let handle = thread::spawn(move || {
            let t0 = Instant::now();
            let mut last = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(POLL);
                if last.elapsed() < TICK {
                    continue;
                }
                last = Instant::now();
                let bd = this.bytes_done.load(Ordering::Relaxed);
                let bt = this.bytes_total.load(Ordering::Relaxed);
                let bpct = if bt > 0 { (bd as f64 / bt as f64) * 100.0 } else { 0.0 };
                log::info!(
                    "[{:>4}s] {} | files {}/{} | bytes {}% | blocks hashed {}",
                    t0.elapsed().as_secs(),
                    this.stage(),
                    this.files_done.load(Ordering::Relaxed),
                    this.files_total.load(Ordering::Relaxed),
                    bpct as i32,
                    this.blocks_hashed.load(Ordering::Relaxed),
                );
            }
        });
        if let Ok(mut t) = self.ticker.lock() {
            *t = Some(handle);
        }
    }

    /// Stop the ticker and wait for it to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.ticker.lock().ok().and_then(|mut t| t.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}
