use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use jobres::pack::{Packer, Unpacker};
use jobres::protocol::PROTOCOL_VERSION;
use jobres::{Bitmap, JobResources, NodeRecord, NodeTable};

fn create_table(node_count: usize) -> NodeTable {
    NodeTable::new(
        (0..node_count)
            .map(|i| NodeRecord::new(format!("node{i}"), 2, 16, 2))
            .collect(),
    )
}

fn create_job(table: &NodeTable, nodes: impl Iterator<Item = usize>) -> JobResources {
    let mut jr = JobResources::with_node_bitmap(Bitmap::from_indices(table.len(), nodes));
    jr.build(table).unwrap();
    jr.nodes = Some(table.bitmap_to_names(jr.node_bitmap.as_ref().unwrap()));
    jr.cpus = vec![64; jr.nhosts as usize];
    jr.ncpus = jr.build_cpu_array(table).unwrap();
    for node in (0..jr.nhosts as usize).step_by(2) {
        jr.set_node(node).unwrap();
    }
    jr
}

fn bench_pack(c: &mut Criterion) {
    for node_count in [10, 1_000, 10_000] {
        let table = create_table(node_count);
        let jr = create_job(&table, 0..node_count);
        c.bench_with_input(BenchmarkId::new("pack", node_count), &jr, |b, jr| {
            b.iter(|| {
                let mut packer = Packer::new();
                jr.pack(&mut packer, PROTOCOL_VERSION).unwrap();
                black_box(packer.freeze())
            });
        });

        let mut packer = Packer::new();
        jr.pack(&mut packer, PROTOCOL_VERSION).unwrap();
        let data = packer.freeze();
        c.bench_with_input(BenchmarkId::new("unpack", node_count), &data, |b, data| {
            b.iter(|| {
                let mut unpacker = Unpacker::new(data);
                black_box(JobResources::unpack(&mut unpacker, PROTOCOL_VERSION).unwrap())
            });
        });
    }
}

fn bench_or(c: &mut Criterion) {
    for node_count in [10, 1_000, 10_000] {
        let table = create_table(node_count);
        let a = create_job(&table, (0..node_count).step_by(2));
        let b = create_job(&table, (0..node_count).step_by(3));
        c.bench_with_input(
            BenchmarkId::new("or", node_count),
            &(a, b),
            |bencher, (a, b)| {
                bencher.iter_batched_ref(
                    || a.clone(),
                    |a| a.or(b).unwrap(),
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

fn bench_extract(c: &mut Criterion) {
    for node_count in [10, 1_000, 10_000] {
        let table = create_table(node_count);
        let jr = create_job(&table, 0..node_count);
        c.bench_with_input(
            BenchmarkId::new("extract middle node", node_count),
            &jr,
            |b, jr| {
                b.iter_batched_ref(
                    || jr.clone(),
                    |jr| jr.extract_node(node_count / 2, &table).unwrap(),
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

criterion_group!(resources, bench_pack, bench_or, bench_extract);
criterion_main!(resources);
