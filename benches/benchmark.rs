use criterion::BenchmarkId;
use criterion::{criterion_group, criterion_main, Criterion};
use perfcollect::buffer::{PcBuffer, SampleBuffer};
use perfcollect::stacks::{CountedStackTable, StackTraceTable};
use rand::distributions::{Distribution, Uniform};

fn addresses(count: usize, distinct: u64) -> Vec<u64> {
    let between = Uniform::from(0..distinct);
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| 0x40_0000 + 16 * between.sample(&mut rng))
        .collect()
}

pub fn benchmark_pc_buffer_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("PcBuffer::add");
    for distinct in [64u64, 1024, 16 * 1024] {
        let samples = addresses(10_000, distinct);
        group.bench_with_input(BenchmarkId::from_parameter(distinct), &samples, |b, samples| {
            let mut buffer = PcBuffer::<()>::new(15 * 1024, 10_000_000);
            b.iter(|| {
                for pc in samples {
                    if buffer.add(*pc, &()) == perfcollect::buffer::Admission::NoRoom {
                        buffer.reset();
                    }
                }
            })
        });
    }
    group.finish();
}

pub fn benchmark_stack_interning(c: &mut Criterion) {
    let mut group = c.benchmark_group("stack interning");
    let stacks: Vec<Vec<u64>> = (0..32u64)
        .map(|i| (0..24u64).map(|frame| 0x40_0000 + 64 * frame + i).collect())
        .collect();

    group.bench_function("StackTraceTable::intern_if_new", |b| {
        let mut table = StackTraceTable::with_capacity(384 * 15);
        b.iter(|| {
            for stack in &stacks {
                if table.intern_if_new(stack).is_err() {
                    table.reset();
                }
            }
        })
    });
    group.bench_function("CountedStackTable::record_or_increment", |b| {
        let mut table = CountedStackTable::with_capacity(1024);
        b.iter(|| {
            for stack in &stacks {
                if table.record_or_increment(stack, 1).is_err() {
                    table.reset();
                }
            }
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_pc_buffer_add, benchmark_stack_interning);
criterion_main!(benches);
