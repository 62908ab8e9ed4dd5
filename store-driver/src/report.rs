// Reporting of workload results and store statistics

use crate::workload::WorkloadOutcome;
use tierstore::metrics::CacheMetrics;
use tierstore::TieredStore;

/// Prints the workload outcome followed by the store's own metrics.
pub fn print(store: &TieredStore<u64, Vec<u8>>, outcome: &WorkloadOutcome) {
    println!("=== Workload ===");
    println!("{:<24} {:>14}", "operations", outcome.operations());
    println!("{:<24} {:>14}", "reads", outcome.reads);
    println!("{:<24} {:>14}", "read hits", outcome.read_hits);
    println!("{:<24} {:>14}", "writes", outcome.writes);
    println!("{:<24} {:>14}", "removes", outcome.removes);
    println!("{:<24} {:>14}", "spills", outcome.spills);
    println!("{:<24} {:>14}", "flushed", outcome.flushed);
    println!("{:<24} {:>14}", "expired", outcome.expired);
    println!("{:<24} {:>14}", "errors", outcome.errors);
    println!("{:<24} {:>14.3}", "elapsed (s)", outcome.elapsed.as_secs_f64());
    println!("{:<24} {:>14.0}", "throughput (ops/s)", outcome.throughput());

    println!();
    println!("=== {} ===", store.algorithm_name());
    for (name, value) in store.metrics() {
        if value.fract() == 0.0 {
            println!("{:<24} {:>14}", name, value as u64);
        } else {
            println!("{:<24} {:>14.4}", name, value);
        }
    }
}
