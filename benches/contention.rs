use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Weekday;
use ulid::Ulid;

use turnero::engine::{Engine, EngineError, EngineSettings};
use turnero::model::*;
use turnero::store::{ScheduleAdmin, WalStore};

const PROFESSIONALS: u64 = 8;
const CLIENTS_PER_KEY: usize = 16;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: n=0");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn setup(store: &WalStore) -> Vec<ResourceKey> {
    let mut keys = Vec::new();
    for professional_id in 1..=PROFESSIONALS {
        let schedule = ScheduleKey {
            professional_id,
            room_id: 1,
            weekday: Weekday::Mon,
        };
        store
            .set_schedule(
                schedule,
                vec![
                    WorkingWindow::named(8 * 60, 13 * 60, "morning"),
                    WorkingWindow::named(14 * 60, 20 * 60, "afternoon"),
                ],
            )
            .await
            .expect("set_schedule");
        store
            .set_slot_duration(professional_id, 15)
            .await
            .expect("set_slot_duration");
        keys.push(ResourceKey::new(professional_id, 1, Day::Weekday(Weekday::Mon)));
    }
    keys
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("turnero_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let store = Arc::new(WalStore::open(&dir.join("bench.wal")).expect("open WAL"));
    let keys = setup(&store).await;
    let engine = Arc::new(Engine::with_store(store.clone(), EngineSettings::default()));

    println!(
        "contention: {} keys x {CLIENTS_PER_KEY} clients, every client walks the whole day",
        keys.len()
    );

    let started = Instant::now();
    let mut handles = Vec::new();
    for key in &keys {
        for client in 0..CLIENTS_PER_KEY {
            let engine = engine.clone();
            let key = *key;
            handles.push(tokio::spawn(async move {
                let mut confirmed = Vec::new();
                let mut rejected = Vec::new();
                let mut slots = engine
                    .get_availability(&key)
                    .await
                    .expect("availability")
                    .free_starts();
                // Spread clients over the grid so they collide partially.
                let len = slots.len().max(1);
                slots.rotate_left((client * 3) % len);
                for start in slots {
                    let t = Instant::now();
                    match engine.book(&key, start, format!("client {client}")).await {
                        Ok(_) => confirmed.push(t.elapsed()),
                        Err(EngineError::SlotNoLongerAvailable { .. }) => rejected.push(t.elapsed()),
                        Err(e) => panic!("unexpected booking error: {e}"),
                    }
                }
                (confirmed, rejected)
            }));
        }
    }

    let mut confirmed = Vec::new();
    let mut rejected = Vec::new();
    for handle in handles {
        let (c, r) = handle.await.expect("client task");
        confirmed.extend(c);
        rejected.extend(r);
    }
    let elapsed = started.elapsed();

    println!("  wall time: {:.2}s", elapsed.as_secs_f64());
    print_latency("confirmed", &mut confirmed);
    print_latency("rejected", &mut rejected);

    for key in &keys {
        let view = engine.get_availability(key).await.expect("availability");
        let free = view.free_starts().len();
        assert_eq!(free, 0, "{key}: {free} slots left free");
    }
    assert_eq!(confirmed.len(), keys.len() * 44, "each slot confirmed exactly once");
    println!("  ok: every slot confirmed exactly once");

    let _ = std::fs::remove_dir_all(&dir);
}
