use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rsdl::{DataMap, SdlConfig, SdlStorage, SyncLock, SyncStorage};
use std::time::Duration;
use tempfile::TempDir;

fn single(key: &str, value: &[u8]) -> DataMap {
    let mut data = DataMap::new();
    data.insert(key.to_string(), value.to_vec());
    data
}

fn populate<S: SyncStorage>(sdl: &S, ns: &str, count: usize) {
    let data: DataMap = (0..count)
        .map(|i| (format!("key{:05}", i), format!("value{}", i).into_bytes()))
        .collect();
    sdl.set(ns, &data).unwrap();
}

// ============================================================================
// Benchmark: Set Operations
// ============================================================================

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_operations");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let sdl = SdlStorage::in_memory();

    group.bench_function("memory_single_set", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            sdl.set("bench", &single(&format!("key{}", counter % 1000), b"value"))
                .unwrap()
        })
    });

    // Batches of varying size
    for size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        let data: DataMap = (0..*size)
            .map(|i| (format!("batch{}", i), b"value".to_vec()))
            .collect();
        group.bench_with_input(BenchmarkId::new("memory_batch_set", size), size, |b, _| {
            b.iter(|| sdl.set("bench", black_box(&data)).unwrap())
        });
    }

    let dir = TempDir::new().unwrap();
    let sled = SdlStorage::open_sled(&SdlConfig::sled(dir.path())).unwrap();
    group.bench_function("sled_single_set", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            sled.set("bench", &single(&format!("key{}", counter % 1000), b"value"))
                .unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Get Operations
// ============================================================================

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_operations");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let sdl = SdlStorage::in_memory();
    populate(&sdl, "bench", 1000);

    group.bench_function("single_get", |b| {
        b.iter(|| sdl.get("bench", black_box(&["key00001"])).unwrap())
    });

    let keys: Vec<String> = (0..100).map(|i| format!("key{:05}", i * 7)).collect();
    group.throughput(Throughput::Elements(100));
    group.bench_function("multi_get_100", |b| {
        b.iter(|| sdl.get("bench", black_box(&keys[..])).unwrap())
    });

    let missing: Vec<String> = (0..100).map(|i| format!("nope{}", i)).collect();
    group.bench_function("get_with_misses_100", |b| {
        b.iter(|| sdl.get("bench", black_box(&missing[..])).unwrap())
    });

    group.finish();
}

// ============================================================================
// Benchmark: Conditional Operations
// ============================================================================

fn bench_conditional(c: &mut Criterion) {
    let mut group = c.benchmark_group("conditional_operations");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let sdl = SdlStorage::in_memory();
    sdl.set("bench", &single("flip", b"a")).unwrap();

    group.bench_function("set_if_swap", |b| {
        let mut flag = false;
        b.iter(|| {
            let (old, new): (&[u8], &[u8]) = if flag { (b"b", b"a") } else { (b"a", b"b") };
            flag = !flag;
            sdl.set_if("bench", "flip", old, new).unwrap()
        })
    });

    group.bench_function("set_if_mismatch", |b| {
        b.iter(|| sdl.set_if("bench", "flip", b"zzz", b"c").unwrap())
    });

    group.bench_function("set_if_not_exists_then_remove_if", |b| {
        b.iter(|| {
            sdl.set_if_not_exists("bench", "once", b"v").unwrap();
            sdl.remove_if("bench", "once", b"v").unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Pattern Scans
// ============================================================================

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    for size in [10usize, 100, 1000].iter() {
        let sdl = SdlStorage::in_memory();
        populate(&sdl, "bench", *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("find_keys_all", size), size, |b, _| {
            b.iter(|| sdl.find_keys("bench", "*").unwrap())
        });
        group.bench_with_input(BenchmarkId::new("find_keys_class", size), size, |b, _| {
            b.iter(|| sdl.find_keys("bench", "key000[0-4]?").unwrap())
        });
        group.bench_with_input(BenchmarkId::new("find_and_get_all", size), size, |b, _| {
            b.iter(|| sdl.find_and_get("bench", "*").unwrap())
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Groups
// ============================================================================

fn bench_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_operations");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let sdl = SdlStorage::in_memory();
    let members: Vec<String> = (0..100).map(|i| format!("member{}", i)).collect();
    sdl.add_member("bench", "big", &members[..]).unwrap();

    group.bench_function("add_then_remove_member", |b| {
        b.iter(|| {
            sdl.add_member("bench", "small", &["x"]).unwrap();
            sdl.remove_member("bench", "small", &["x"]).unwrap()
        })
    });

    group.bench_function("is_member_100", |b| {
        b.iter(|| sdl.is_member("bench", "big", black_box(b"member42")).unwrap())
    });

    group.bench_function("get_members_100", |b| {
        b.iter(|| sdl.get_members("bench", "big").unwrap())
    });

    group.finish();
}

// ============================================================================
// Benchmark: Locks
// ============================================================================

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_operations");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let sdl = SdlStorage::in_memory();
    let lock = sdl
        .get_lock_resource("bench", "mutex", Duration::from_secs(10))
        .unwrap();

    group.bench_function("try_acquire_release", |b| {
        b.iter(|| {
            lock.try_acquire().unwrap();
            lock.release().unwrap()
        })
    });

    group.bench_function("scoped_with_lock", |b| {
        b.iter(|| {
            lock.with_lock(|| Ok::<_, rsdl::SdlError>(black_box(1)))
                .unwrap()
        })
    });

    lock.try_acquire().unwrap();
    group.bench_function("refresh_held", |b| b.iter(|| lock.refresh().unwrap()));
    group.bench_function("validity_time", |b| {
        b.iter(|| lock.get_validity_time().unwrap())
    });
    lock.release().unwrap();

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_conditional,
    bench_find,
    bench_groups,
    bench_locks
);
criterion_main!(benches);
