//! Performance sanity checks for the per-tick hot paths

use assert_approx_eq::assert_approx_eq;
use server::cache::{Pool, Store};
use server::config::PoolConfig;
use server::error::Result;
use server::scheduler::{EntityScheduler, Regeneration};
use server::world::{shared, Mobile, Room, Vitals};
use shared::CacheKey;
use std::collections::HashSet;
use std::time::Instant;

/// Serves empty rooms without touching the disk.
struct MemoryRooms;

impl Store<Room> for MemoryRooms {
    fn load(&self, key: &CacheKey) -> Result<Room> {
        Ok(Room::empty(key))
    }

    fn save(&self, _key: &CacheKey, _value: &Room) -> Result<()> {
        Ok(())
    }
}

/// Benchmarks resident lookups in a full room pool
#[test]
fn benchmark_cache_hits() {
    let mut pool = Pool::new("rooms", PoolConfig::new(600), Box::new(MemoryRooms));
    let keys: Vec<CacheKey> = (0..600).map(|n| CacheKey::new("bench", n)).collect();
    for key in &keys {
        pool.fetch(key).unwrap();
    }

    let iterations = 10_000;
    let start = Instant::now();
    for i in 0..iterations {
        let _ = pool.fetch(&keys[i % keys.len()]).unwrap();
    }
    let duration = start.elapsed();
    println!(
        "Cache hits: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    let stats = pool.stats();
    assert_eq!(stats.misses, 600);
    assert_eq!(stats.hits, iterations as u64);
    assert_approx_eq!(stats.hit_rate(), 10_000.0 / 10_600.0, 1e-9);

    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks churn through a pool much smaller than the working set
#[test]
fn benchmark_cache_eviction() {
    let mut pool = Pool::new("rooms", PoolConfig::new(200), Box::new(MemoryRooms));

    let iterations = 20_000u32;
    let start = Instant::now();
    for n in 0..iterations {
        pool.fetch(&CacheKey::new("bench", n % 1000)).unwrap();
    }
    let duration = start.elapsed();
    println!(
        "Cache churn: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / f64::from(iterations)
    );

    assert_eq!(pool.len(), 200);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks one scheduler pass over a large active list
#[test]
fn benchmark_scheduler_pass() {
    let observed: HashSet<CacheKey> = (0..50).map(|n| CacheKey::new("bench", n)).collect();
    let mobiles: Vec<_> = (0..5_000u32)
        .map(|n| {
            let mut vitals = Vitals::new(100, 0);
            vitals.hp = 1;
            shared(Mobile {
                name: format!("mobile {}", n),
                vitals,
                room: Some(CacheKey::new("bench", n % 50)),
                ..Mobile::default()
            })
        })
        .collect();

    let mut scheduler = EntityScheduler::new();
    for mobile in &mobiles {
        scheduler.track(mobile);
    }
    let mut sim = Regeneration;

    let passes = 20;
    let start = Instant::now();
    for _ in 0..passes {
        let report = scheduler.tick(&mut sim, &observed);
        assert_eq!(report.simulated, mobiles.len());
    }
    let duration = start.elapsed();
    println!(
        "Scheduler: {} passes over {} mobiles in {:?}",
        passes,
        mobiles.len(),
        duration
    );

    assert_eq!(mobiles[0].borrow().vitals.hp, 21);
    // A pass must fit comfortably inside a 100ms tick
    assert!(duration.as_millis() / passes < 100);
}
