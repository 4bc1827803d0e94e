//! Benchmarks for latency summaries, tolerance tallies and short runs.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use phaseflow::instrumentation::LatencyPercentiles;
use phaseflow::prelude::*;
use phaseflow::tolerance::ErrorToleranceTracker;
use serde_json::json;

fn latency_benchmark(c: &mut Criterion) {
    let samples: Vec<f64> = (0..1000).map(|i| f64::from((i * 7919) % 1000)).collect();
    c.bench_function("latency_percentiles_1000", |b| {
        b.iter(|| LatencyPercentiles::from_samples(black_box(&samples)));
    });
}

fn tolerance_benchmark(c: &mut Criterion) {
    c.bench_function("tolerance_tally_10000", |b| {
        b.iter(|| {
            let tracker = ErrorToleranceTracker::new("cells", 10_000, TolerancePolicy::default());
            for i in 0..10_000 {
                if i % 20 == 0 {
                    tracker.record_failure();
                } else {
                    tracker.record_success();
                }
            }
            black_box(tracker.can_mark_success(RuntimeMode::Strict))
        });
    });
}

fn run_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = Orchestrator::builder()
        .stage(StageDescriptor::blocking("ingest", "Ingest", |_| Ok(json!(1))))
        .stage(StageDescriptor::cooperative("score", "Score", |ctx| async move {
            let rows = ctx.require_output("ingest")?.clone();
            Ok::<_, HandlerError>(rows)
        }))
        .resource_probe(Arc::new(FixedResourceProbe::new(64.0, 5.0)))
        .event_sink(Arc::new(NoOpEventSink))
        .build()
        .unwrap();

    c.bench_function("two_stage_run", |b| {
        b.iter(|| runtime.block_on(orchestrator.run(json!({}))));
    });
}

criterion_group!(benches, latency_benchmark, tolerance_benchmark, run_benchmark);
criterion_main!(benches);
