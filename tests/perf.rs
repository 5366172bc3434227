#![cfg(feature = "memory-store")]

use futures::executor::block_on;
use rs_gatekeeper::{MemoryStore, PolicyEngine, RoleValue, Rule};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

const REPEATS: usize = 5;

fn report(name: &str, total_ops: usize, mut samples: Vec<std::time::Duration>) {
    samples.sort_unstable();
    let median = samples[REPEATS / 2];
    let ns_per_op = median.as_secs_f64() * 1_000_000_000.0 / total_ops as f64;
    let ops_per_sec = total_ops as f64 / median.as_secs_f64();
    println!(
        "{name}: median={:.3} ms, ns/op={ns_per_op:.1}, ops/s={ops_per_sec:.0} (ops={total_ops}, repeats={REPEATS})",
        median.as_secs_f64() * 1_000.0
    );
}

fn engine(rule_count: usize) -> (Arc<PolicyEngine<MemoryStore>>, RoleValue) {
    let role = RoleValue::new("operator").unwrap();
    let engine = PolicyEngine::new(Arc::new(MemoryStore::new()));
    let mut rules: Vec<Rule> = (0..rule_count)
        .map(|i| Rule::new(format!("/api/admin/resource_{i}/:id"), "GET").unwrap())
        .collect();
    rules.push(Rule::new("/api/admin/menu/*", "GET").unwrap());
    block_on(engine.replace_rules(&role, rules)).unwrap();
    (Arc::new(engine), role)
}

#[test]
#[ignore = "manual performance test; run with --ignored --nocapture"]
fn perf_policy_evaluate() {
    let iterations = 500_000;

    for rule_count in [1usize, 64, 512] {
        let (engine, role) = engine(rule_count);
        let mut samples = Vec::with_capacity(REPEATS);
        for _ in 0..REPEATS {
            let start = Instant::now();
            for _ in 0..iterations {
                black_box(engine.evaluate(&role, "/api/admin/menu/tree", "GET"));
            }
            samples.push(start.elapsed());
        }
        report(&format!("evaluate_rules_{rule_count}"), iterations, samples);
    }

    let threads = std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4);
    let per_thread = 100_000;
    let (engine, role) = engine(64);
    let mut samples = Vec::with_capacity(REPEATS);
    for _ in 0..REPEATS {
        let start = Instant::now();
        let joins: Vec<_> = (0..threads)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let role = role.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        black_box(engine.evaluate(&role, "/api/admin/menu/tree", "GET"));
                    }
                })
            })
            .collect();
        for join in joins {
            join.join().expect("thread panicked");
        }
        samples.push(start.elapsed());
    }
    report("evaluate_parallel", threads * per_thread, samples);
}
