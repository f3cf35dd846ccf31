use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use escr_core::{EventId, ProjectionId, SequenceNumber};
use escr_race_tracker::{LogPosition, TraceEntries, TraceEntry, TraceEntryType, TracePayload, WorkerId};

/// `workers` workers taking turns, each applying `batch` events per turn.
fn serialized_trace(entries: usize, workers: usize, batch: usize) -> TraceEntries {
    let projections: Vec<ProjectionId> = ["graph", "uri_paths", "assets"]
        .iter()
        .map(|p| ProjectionId::new(*p).unwrap())
        .collect();
    let mut trace = Vec::with_capacity(entries);
    let mut seq = 0u64;
    let mut turn = 0usize;

    while trace.len() < entries {
        let worker = WorkerId::new(format!("{}/1", turn % workers));
        let projection = &projections[turn % projections.len()];
        for _ in 0..batch {
            seq += 1;
            trace.push(TraceEntry::new(
                LogPosition::new(trace.len().to_string()),
                worker.clone(),
                TraceEntryType::InCriticalSection,
                TracePayload {
                    projection: projection.clone(),
                    event_type: Some("NodeWasCreated".into()),
                    sequence_number: Some(SequenceNumber::new(seq)),
                    event_id: Some(EventId::new()),
                },
            ));
        }
        trace.push(TraceEntry::new(
            LogPosition::new(trace.len().to_string()),
            worker,
            TraceEntryType::LockWillBeReleased,
            TracePayload::projection(projection),
        ));
        turn += 1;
    }
    TraceEntries::new(trace)
}

fn bench_trace_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_analysis");

    for entries in [1_000, 10_000, 100_000].iter() {
        let trace = serialized_trace(*entries, 8, 10);
        group.throughput(Throughput::Elements(trace.len() as u64));

        group.bench_with_input(BenchmarkId::new("concurrency_violations", entries), &trace, |b, trace| {
            b.iter(|| black_box(trace.concurrency_violations()));
        });
        group.bench_with_input(BenchmarkId::new("duplicate_processing", entries), &trace, |b, trace| {
            b.iter(|| black_box(trace.duplicate_processing()));
        });
        group.bench_with_input(BenchmarkId::new("verify", entries), &trace, |b, trace| {
            b.iter(|| black_box(trace.verify()).is_ok());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_trace_analysis);
criterion_main!(benches);
