//! Process-wide event counters.
//!
//! Every interesting event (`auth.succeed`, `command.stat`,
//! `transfer.egress_bytes`, ...) increments a named counter. Totals grow
//! monotonically; a 1 Hz sampler additionally keeps a small rolling window
//! of per-second deltas per counter, from which the stats endpoint derives
//! rates.

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Number of per-second samples kept per counter.
pub const SAMPLE_WINDOW: usize = 10;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct Registry {
    totals: DashMap<String, AtomicU64>,
    windows: Mutex<HashMap<String, Window>>,
}

#[derive(Default)]
struct Window {
    last_total: u64,
    samples: VecDeque<u64>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            totals: DashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }
}

/// Increments the named counter.
pub fn count(name: &str, delta: u64) {
    if let Some(counter) = REGISTRY.totals.get(name) {
        counter.fetch_add(delta, Ordering::Relaxed);
        return;
    }
    REGISTRY
        .totals
        .entry(name.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(delta, Ordering::Relaxed);
}

/// Increments the per-command counter for a session verb.
pub fn count_command(verb: &str) {
    count(&format!("command.{}", verb), 1);
}

/// A snapshot of all counter totals.
pub fn totals() -> BTreeMap<String, u64> {
    REGISTRY
        .totals
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

/// Takes one sample: pushes the delta since the previous sample into each
/// counter's rolling window. Called at 1 Hz by [`spawn_sampler`], and by
/// tests directly.
pub fn sample() {
    let mut windows = match REGISTRY.windows.lock() {
        Ok(windows) => windows,
        Err(poisoned) => poisoned.into_inner(),
    };
    for entry in REGISTRY.totals.iter() {
        let total = entry.value().load(Ordering::Relaxed);
        let window = windows.entry(entry.key().clone()).or_default();
        let delta = total.saturating_sub(window.last_total);
        window.last_total = total;
        window.samples.push_back(delta);
        while window.samples.len() > SAMPLE_WINDOW {
            window.samples.pop_front();
        }
    }
}

/// Rolling-window average rate per counter, in events per second.
pub fn rates() -> BTreeMap<String, f64> {
    let windows = match REGISTRY.windows.lock() {
        Ok(windows) => windows,
        Err(poisoned) => poisoned.into_inner(),
    };
    windows
        .iter()
        .filter(|(_, window)| !window.samples.is_empty())
        .map(|(name, window)| {
            let sum: u64 = window.samples.iter().sum();
            (name.clone(), sum as f64 / window.samples.len() as f64)
        })
        .collect()
}

/// Spawns the 1 Hz sampling loop.
pub fn spawn_sampler() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            sample();
        }
    })
}
