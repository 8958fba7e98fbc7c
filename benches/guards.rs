use std::hint::black_box;
use std::time::Duration;

use async_trait::async_trait;
use callguard::{
    CacheConfig, ManageConnection, Pool, PoolConfig, RateLimitPolicy, RateLimiter, ResponseCache,
};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_consume(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitPolicy::new(u32::MAX, 60, 60)).unwrap();
    let keys: Vec<String> = (0..1_000).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();

    c.bench_function("limiter_consume_1k_keys", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(limiter.consume(black_box(key), 1)).ok();
        })
    });
}

fn bench_cache(c: &mut Criterion) {
    let config = CacheConfig {
        max_entries: 500,
        ..Default::default()
    };
    let cache: ResponseCache = ResponseCache::new(&config);
    for i in 0..500 {
        cache.set(format!("key-{i}"), serde_json::json!({ "n": i }), None);
    }

    c.bench_function("cache_get_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = format!("key-{}", i % 500);
            i += 1;
            black_box(cache.get(&key));
        })
    });

    c.bench_function("cache_set_with_eviction", |b| {
        let mut i = 0usize;
        b.iter(|| {
            cache.set(format!("new-{i}"), serde_json::json!(i), Some(Duration::from_secs(60)));
            i += 1;
        })
    });

    c.bench_function("cache_key_sha256", |b| {
        let parts: [&[u8]; 3] = [b"POST", b"/v1/transcribe", br#"{"lang":"en"}"#];
        b.iter(|| ResponseCache::<serde_json::Value>::cache_key(black_box(&parts)))
    });
}

struct Noop;

#[async_trait]
impl ManageConnection for Noop {
    type Connection = ();

    async fn create(&self) -> callguard::Result<()> {
        Ok(())
    }
}

fn bench_pool(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = rt
        .block_on(Pool::new(
            Noop,
            PoolConfig {
                min: 4,
                max: 4,
                acquire_timeout_ms: 1_000,
            },
        ))
        .unwrap();

    c.bench_function("pool_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let conn = pool.acquire().await.unwrap();
            pool.release(conn).await;
        })
    });
}

criterion_group!(benches, bench_consume, bench_cache, bench_pool);
criterion_main!(benches);
