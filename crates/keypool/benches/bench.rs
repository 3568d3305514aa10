use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use keypool::{Acquire, Alphabet, CandidateKey, LocalCache, ThreadRandomKeys, mint_batch};
use std::{thread, time::Instant};

// Keys pushed through the cache per benchmark iteration
const TOTAL_KEYS: usize = 64 * 1024;

/// Mint and deduplicate batches the size a generator run typically asks for.
fn bench_mint_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("mint_batch");

    for (alphabet, name) in [
        (Alphabet::Alphanumeric, "alphanumeric"),
        (Alphabet::UrlSafe, "url_safe"),
    ] {
        for batch in [334, 4_096] {
            group.throughput(Throughput::Elements(batch as u64));
            group.bench_function(format!("{name}/len/7/batch/{batch}"), |b| {
                let mut keys = ThreadRandomKeys::new(7, alphabet).unwrap();
                b.iter(|| black_box(mint_batch(&mut keys, batch)));
            });
        }
    }

    group.finish();
}

/// Drain a pre-filled cache from several threads at once.
fn bench_acquire_one(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cache/acquire_one");
    let keys: Vec<CandidateKey> = (0..TOTAL_KEYS)
        .map(|i| CandidateKey::new(format!("{i:07}")))
        .collect();

    for threads in [1, 2, 4, 8] {
        group.throughput(Throughput::Elements(TOTAL_KEYS as u64));
        group.bench_function(format!("elems/{TOTAL_KEYS}/threads/{threads}"), |b| {
            b.iter_custom(|iters| {
                let mut elapsed = core::time::Duration::ZERO;

                for _ in 0..iters {
                    let cache = LocalCache::with_capacity(TOTAL_KEYS);
                    cache.extend(keys.iter().cloned());

                    let start = Instant::now();
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let cache = cache.clone();
                            thread::spawn(move || {
                                while let Acquire::Key(key) = cache.acquire_one() {
                                    black_box(key);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    elapsed += start.elapsed();
                }

                elapsed
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mint_batch, bench_acquire_one);
criterion_main!(benches);
