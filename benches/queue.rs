use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use attrdedup::{
    attribute_index, deduplicate, Attribute, AttributeQueue, CancelToken, DiskQueue,
    DiskQueueOptions, EdgeLabel, EdgeProperties, KeyspaceIndexPair, MemoryGraph, MemoryQueue,
    VertexId,
};

const BATCH: usize = 256;

fn attr(n: u64) -> Attribute {
    Attribute::new("bench", attribute_index("name", &format!("v{}", n % 64)), VertexId(n))
}

/// Insert `BATCH` records, read them back and ack them.
fn cycle(q: &dyn AttributeQueue, cancel: &CancelToken) {
    for n in 0..BATCH as u64 {
        q.insert(attr(n)).unwrap();
    }
    let batch = q.read(BATCH, cancel).unwrap();
    q.ack(&batch).unwrap();
}

fn bench_memory_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_memory");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("insert_read_ack", |b| {
        let q = MemoryQueue::new();
        let cancel = CancelToken::new();
        b.iter(|| cycle(&q, &cancel));
    });
    group.finish();
}

fn bench_disk_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_disk");
    group.throughput(Throughput::Elements(BATCH as u64));

    // fsync per frame dominates; measure the framing and log path without it.
    group.bench_function("insert_read_ack_nosync", |b| {
        let dir = tempfile::tempdir().unwrap();
        let q = DiskQueue::open(
            dir.path(),
            DiskQueueOptions {
                sync_on_write: false,
                ..DiskQueueOptions::default()
            },
        )
        .unwrap();
        let cancel = CancelToken::new();
        b.iter(|| cycle(&q, &cancel));
    });
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ten_duplicates", |b| {
        b.iter_custom(|iters| {
            let graph = MemoryGraph::new();
            let index = attribute_index("name", "dup");
            let pair = KeyspaceIndexPair::new("bench", index.as_str());
            let mut elapsed = std::time::Duration::ZERO;
            for _ in 0..iters {
                // Fresh duplicates per iteration so every merge does real work.
                for _ in 0..10 {
                    let a = graph.insert_attribute("bench", &index).unwrap();
                    let owner = graph.insert_vertex("bench", "person").unwrap();
                    graph
                        .add_edge("bench", owner, a, EdgeLabel::Has, EdgeProperties::new())
                        .unwrap();
                }
                let start = Instant::now();
                deduplicate(&graph, &pair).unwrap();
                elapsed += start.elapsed();
            }
            elapsed
        })
    });
    group.finish();
}

criterion_group!(queue, bench_memory_queue, bench_disk_queue, bench_merge);
criterion_main!(queue);
