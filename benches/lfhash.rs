use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lfhash::{KeySpec, LfHash};

const ITER: u64 = 32 * 1024;

#[derive(Clone, Copy)]
struct Entry {
    key: [u8; 8],
    val: u64,
}

fn entry_key(e: &Entry) -> &[u8] {
    &e.key
}

fn entry(n: u64) -> Entry {
    Entry {
        key: n.to_le_bytes(),
        val: n + 7,
    }
}

fn task_insert(threads: u64) -> LfHash<Entry> {
    let table = LfHash::new(KeySpec::Extract(entry_key));
    let inc = ITER / threads;

    std::thread::scope(|s| {
        for t in 0..threads {
            let table = &table;
            s.spawn(move || {
                let mut pins = table.pin();
                let start = t * inc;
                let end = if t == threads - 1 { ITER } else { start + inc };
                for i in start..end {
                    table.insert(&mut pins, entry(i)).unwrap();
                }
            });
        }
    });
    table
}

fn insert_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_entry");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get() as u64;

    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_insert(threads));
            },
        );
    }

    group.finish();
}

fn task_get(table: &LfHash<Entry>, threads: u64) {
    let inc = ITER / threads;
    std::thread::scope(|s| {
        for t in 0..threads {
            let table = &table;
            s.spawn(move || {
                let mut pins = table.pin();
                let start = t * inc;
                let end = if t == threads - 1 { ITER } else { start + inc };
                for i in start..end {
                    let found = table.get(&mut pins, &i.to_le_bytes()).unwrap();
                    assert_eq!(black_box(found.as_deref()).map(|e| e.val), Some(i + 7));
                }
            });
        }
    });
}

fn get_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_entry");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get() as u64;

    for threads in 1..=max {
        let table = task_insert(max);

        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_get(&table, threads));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, insert_entry, get_entry);
criterion_main!(benches);
