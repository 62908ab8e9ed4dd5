//! Workload generation and execution
//!
//! Each worker thread draws keys from a hot/cold split: `hot_traffic_percent`
//! of requests go to the first `hot_keys_percent` of the key space, the rest
//! are spread uniformly over the remaining keys. Operations are picked from
//! a fixed mix, and tier maintenance (spill, flush, expiry) runs every few
//! operations on the worker that hits the interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tierstore::{Element, Result, Substitute, TieredStore};
use tracing::{debug, warn};

/// Parameters for one workload run
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Operations per worker thread
    pub operations: usize,
    /// Size of the key space
    pub keys: u64,
    /// Percentage of traffic that goes to hot keys
    pub hot_traffic_percent: u8,
    /// Percentage of keys that are hot
    pub hot_keys_percent: u8,
    /// Percentage of operations that write
    pub write_percent: u8,
    /// Percentage of operations that remove
    pub remove_percent: u8,
    /// Minimum value size in bytes
    pub min_value_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Time-to-live for written elements; `None` keeps them forever
    pub ttl: Option<Duration>,
    /// Spill a sampled element to the tier every N operations (0 disables)
    pub spill_every: usize,
    /// Flush pending placeholders every N operations (0 disables)
    pub flush_every: usize,
    /// Remove expired elements every N operations (0 disables)
    pub expire_every: usize,
    /// Base seed; worker `t` uses `seed + t`
    pub seed: u64,
}

/// Counts gathered by the workers
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkloadOutcome {
    pub reads: u64,
    pub read_hits: u64,
    pub writes: u64,
    pub removes: u64,
    pub spills: u64,
    pub flushed: u64,
    pub expired: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

impl WorkloadOutcome {
    fn merge(&mut self, other: &WorkloadOutcome) {
        self.reads += other.reads;
        self.read_hits += other.read_hits;
        self.writes += other.writes;
        self.removes += other.removes;
        self.spills += other.spills;
        self.flushed += other.flushed;
        self.expired += other.expired;
        self.errors += other.errors;
    }

    /// Total operations performed
    pub fn operations(&self) -> u64 {
        self.reads + self.writes + self.removes
    }

    /// Operations per second over the whole run
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.operations() as f64 / secs
        } else {
            0.0
        }
    }
}

struct KeyPicker {
    keys: u64,
    hot_keys: u64,
    hot_probability: f64,
}

impl KeyPicker {
    fn new(config: &WorkloadConfig) -> Self {
        let keys = config.keys.max(1);
        let hot_keys = (keys * u64::from(config.hot_keys_percent.min(100)) / 100).clamp(1, keys);
        Self {
            keys,
            hot_keys,
            hot_probability: f64::from(config.hot_traffic_percent.min(100)) / 100.0,
        }
    }

    fn pick(&self, rng: &mut StdRng) -> u64 {
        if self.hot_keys == self.keys || rng.gen_bool(self.hot_probability) {
            rng.gen_range(0..self.hot_keys)
        } else {
            rng.gen_range(self.hot_keys..self.keys)
        }
    }
}

/// Runs the workload against `store` and returns the merged counts.
pub fn run(store: &Arc<TieredStore<u64, Vec<u8>>>, config: &WorkloadConfig) -> WorkloadOutcome {
    let picker = KeyPicker::new(config);
    let start = Instant::now();

    let mut outcome = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let picker = &picker;
                scope.spawn(move || run_worker(store, config, picker, config.seed + t as u64))
            })
            .collect();

        let mut merged = WorkloadOutcome::default();
        for handle in handles {
            match handle.join() {
                Ok(outcome) => merged.merge(&outcome),
                Err(_) => warn!("worker thread panicked"),
            }
        }
        merged
    });

    outcome.elapsed = start.elapsed();
    outcome
}

fn run_worker(
    store: &TieredStore<u64, Vec<u8>>,
    config: &WorkloadConfig,
    picker: &KeyPicker,
    seed: u64,
) -> WorkloadOutcome {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut outcome = WorkloadOutcome::default();
    let in_memory = |s: &Substitute<u64, Vec<u8>>| s.in_memory().is_some();

    for op in 1..=config.operations {
        let key = picker.pick(&mut rng);
        let roll = rng.gen_range(0..100u8);
        let result = if roll < config.write_percent {
            outcome.writes += 1;
            store.put(make_element(key, config, &mut rng)).map(drop)
        } else if roll < config.write_percent.saturating_add(config.remove_percent) {
            outcome.removes += 1;
            store.remove(&key).map(drop)
        } else {
            outcome.reads += 1;
            store.get(&key).map(|found| {
                if found.is_some() {
                    outcome.read_hits += 1;
                }
            })
        };
        record(&mut outcome, result);

        if config.spill_every > 0 && op % config.spill_every == 0 {
            for sample in store.random_sample(&in_memory, 1, Some(&key)) {
                match store.spill(&sample.key) {
                    Ok(true) => outcome.spills += 1,
                    Ok(false) => {}
                    Err(err) => {
                        debug!(error = %err, "spill failed");
                        outcome.errors += 1;
                    }
                }
            }
        }
        if config.flush_every > 0 && op % config.flush_every == 0 {
            let flushed = store.flush();
            if let Ok(count) = flushed {
                outcome.flushed += count as u64;
            }
            record(&mut outcome, flushed.map(drop));
        }
        if config.expire_every > 0 && op % config.expire_every == 0 {
            let expired = store.expire_elements();
            if let Ok(count) = expired {
                outcome.expired += count as u64;
            }
            record(&mut outcome, expired.map(drop));
        }
    }
    outcome
}

fn record(outcome: &mut WorkloadOutcome, result: Result<()>) {
    if let Err(err) = result {
        // Refusals are expected once a bounded pool fills up.
        if err.is_recoverable() {
            debug!(error = %err, "operation refused");
        } else {
            warn!(error = %err, "operation failed");
        }
        outcome.errors += 1;
    }
}

fn make_element(key: u64, config: &WorkloadConfig, rng: &mut StdRng) -> Element<u64, Vec<u8>> {
    let size = if config.max_value_size > config.min_value_size {
        rng.gen_range(config.min_value_size..=config.max_value_size)
    } else {
        config.min_value_size
    };
    let element = Element::with_size(key, vec![0u8; size], size as u64);
    match config.ttl {
        Some(ttl) => element.with_time_to_live(ttl),
        None => element,
    }
}
