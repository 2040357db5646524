//! Performance benchmarks for the hot paths of the session server

use server::store::PlayerStore;
use shared::{ClientMessage, PlayerId, PlayerState, ServerMessage, Transform, TransformLimits};
use std::time::Instant;

/// Benchmarks transform validation, run once per inbound update
#[test]
fn benchmark_transform_validation() {
    let limits = TransformLimits::default();
    let transform = Transform::new([12.5, 3.0, -40.0], vec![0.1, 0.2, 0.3, 0.9]);

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = transform.validate(&limits);
    }

    let duration = start.elapsed();
    println!(
        "Transform validation: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks decoding of client update messages
#[test]
fn benchmark_update_decoding() {
    let text = r#"{"event":"update","data":{"transform":{"position":[1.5,0,-2.25],"orientation":[0,0.7071,0,0.7071]},"timestamp":1234567890}}"#;

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let message = ClientMessage::decode(text).unwrap();
        assert!(matches!(message, ClientMessage::Update(_)));
    }

    let duration = start.elapsed();
    println!(
        "Update decoding: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks encoding a tick broadcast for a full room
#[test]
fn benchmark_state_update_encoding() {
    let states: Vec<PlayerState> = (0..64)
        .map(|i| PlayerState::new(PlayerId::generate(), Transform::at(i as f32, 0.0, i as f32)))
        .collect();
    let message = ServerMessage::StateUpdate(states);

    let iterations = 1_000;
    let start = Instant::now();
    let mut total_bytes = 0;

    for _ in 0..iterations {
        total_bytes += message.encode().unwrap().len();
    }

    let duration = start.elapsed();
    println!(
        "State update encoding: 64 players × {} ticks in {:?} ({:.2} μs/tick, {} bytes/tick)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        total_bytes / iterations
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks store upserts followed by a delta drain, one tick's worth of work
#[tokio::test]
async fn benchmark_store_tick_cycle() {
    let store = PlayerStore::new();
    let ids: Vec<PlayerId> = (0..64).map(|_| PlayerId::generate()).collect();
    for id in &ids {
        store.insert(*id, Transform::default()).await;
    }

    let ticks = 1_000u64;
    let start = Instant::now();

    for tick in 1..=ticks {
        for id in &ids {
            store
                .upsert(*id, Transform::at(tick as f32, 0.0, 0.0), tick, None)
                .await
                .unwrap();
        }
        let delta = store.take_delta().await;
        assert_eq!(delta.len(), ids.len());
    }

    let duration = start.elapsed();
    println!(
        "Store tick cycle: 64 players × {} ticks in {:?} ({:.2} μs/tick)",
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    assert!(duration.as_millis() < 10_000);
}
