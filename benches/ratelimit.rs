use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};

use gridgate::gate::{secret_signature, Principal, Protocol, RateKey, RateLimiter};
use gridgate::RateLimitConfig;

fn gen_addrs(n: usize, seed: u64) -> Vec<IpAddr> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| IpAddr::V4(Ipv4Addr::from(rng.gen::<u32>())))
        .collect()
}

fn bench_ratelimit(c: &mut Criterion) {
    let ns = [1_000usize, 100_000usize];
    let mut group = c.benchmark_group("ratelimit");

    for &n in &ns {
        let addrs = gen_addrs(n, 0xBEEF_CAFE);
        let keys: Vec<Vec<RateKey>> = addrs
            .iter()
            .enumerate()
            .map(|(i, &addr)| {
                let p = Principal::new(format!("user-{}", i % 512), Protocol::Davs);
                RateKey::for_attempt(addr, &p, secret_signature("hunter2"))
            })
            .collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("register_fail", n), &n, |b, _| {
            b.iter(|| {
                let rl = RateLimiter::new(RateLimitConfig::default());
                for ks in &keys {
                    rl.register_hit(ks, false, secret_signature("hunter2"));
                }
                criterion::black_box(rl.bucket_count());
            });
        });

        // Populated limiter for the pre-credential read path.
        let rl = RateLimiter::new(RateLimitConfig::default());
        for ks in &keys {
            rl.register_hit(ks, false, secret_signature("hunter2"));
        }
        group.bench_with_input(BenchmarkId::new("hit_allowed", n), &n, |b, _| {
            b.iter(|| {
                let mut allowed = 0usize;
                for ks in &keys {
                    if rl.first_breach(ks).is_none() {
                        allowed += 1;
                    }
                }
                criterion::black_box(allowed);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ratelimit);
criterion_main!(benches);
