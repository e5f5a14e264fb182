// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

mod common;

use anyhow::Result;
use chrono::Duration;
use common::{at, setup};
use rust_thermal_stress::thermal_regulation::telemetry::StorageError;
use rust_thermal_stress::thermal_regulation::{SharedTelemetryLog, TelemetryLog};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::Mutex;

async fn fill(log: &mut TelemetryLog, from: u32, count: u32) -> Result<()> {
    for i in from..from + count {
        log.append(
            at(13, 0) + Duration::seconds(i as i64),
            vec![30.0, 31.0],
            vec![Some(29.5), None],
        )
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_roll_moves_everything_to_the_archive() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let mut log = TelemetryLog::open(dir.path().join("log.jsonl")).await?;
    fill(&mut log, 0, 25).await?;
    let before: Vec<u64> = log.query(0, 1000).samples.iter().map(|s| s.key).collect();

    let archive = log.roll(at(16, 45)).await?;
    assert_eq!(
        archive.file_name().and_then(|n| n.to_str()),
        Some("log-20240701-164500.jsonl")
    );
    assert!(log.is_empty());
    assert_eq!(log.query(0, 1000).samples.len(), 0);

    let archived = log
        .read_archive("log-20240701-164500.jsonl")
        .await?;
    let archived_keys: Vec<u64> = archived.iter().map(|s| s.key).collect();
    assert_eq!(archived_keys, before);

    // New samples continue the key sequence and never collide with archived keys
    fill(&mut log, 0, 5).await?;
    let new_keys: HashSet<u64> = log.query(0, 1000).samples.iter().map(|s| s.key).collect();
    assert_eq!(new_keys.len(), 5);
    assert!(new_keys.iter().all(|k| *k > *before.last().unwrap_or(&0)));

    let archives = log.archives().await?;
    assert_eq!(archives.len(), 1);
    assert!(archives[0].size > 0);
    Ok(())
}

#[tokio::test]
async fn test_rolls_in_the_same_second_get_distinct_names() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let mut log = TelemetryLog::open(dir.path().join("log.jsonl")).await?;

    fill(&mut log, 0, 2).await?;
    let first = log.roll(at(16, 45)).await?;
    fill(&mut log, 2, 2).await?;
    let second = log.roll(at(16, 45)).await?;

    assert_ne!(first, second);
    assert_eq!(
        second.file_name().and_then(|n| n.to_str()),
        Some("log-20240701-164500-1.jsonl")
    );
    assert_eq!(log.archives().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_cursor_survives_restart() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let path = dir.path().join("log.jsonl");
    let cursor = {
        let mut log = TelemetryLog::open(&path).await?;
        fill(&mut log, 0, 10).await?;
        log.query(0, 4).next
    };

    let mut log = TelemetryLog::open(&path).await?;
    assert_eq!(log.len(), 10);
    let batch = log.query(cursor, 1000);
    assert_eq!(batch.samples.len(), 6);
    assert!(batch.samples.iter().all(|s| s.key > cursor));

    // Appends after a restart keep keys increasing
    let last = log.last_key();
    let sample = log
        .append(at(12, 0), vec![30.0, 31.0], vec![None, None])
        .await?;
    assert!(sample.key > last);
    Ok(())
}

#[tokio::test]
async fn test_batches_chain_without_gaps() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let mut log = TelemetryLog::open(dir.path().join("log.jsonl")).await?;
    fill(&mut log, 0, 23).await?;

    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let batch = log.query(cursor, 10);
        if batch.samples.is_empty() {
            break;
        }
        assert!(batch.samples.len() <= 10);
        seen.extend(batch.samples.iter().map(|s| s.key));
        cursor = batch.next;
    }
    assert_eq!(seen.len(), 23);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rolls_interleave_with_concurrent_appends() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let log: SharedTelemetryLog = Arc::new(Mutex::new(
        TelemetryLog::open(dir.path().join("log.jsonl")).await?,
    ));

    let mut writers = Vec::new();
    for writer in 0..4i64 {
        let log = Arc::clone(&log);
        writers.push(tokio::spawn(async move {
            let mut keys = Vec::new();
            for i in 0..50i64 {
                let stamp = at(13, 0) + Duration::seconds(writer * 1000 + i);
                let sample = log
                    .lock()
                    .await
                    .append(stamp, vec![30.0, 31.0], vec![Some(29.9), None])
                    .await?;
                keys.push(sample.key);
                tokio::task::yield_now().await;
            }
            Ok::<_, StorageError>(keys)
        }));
    }

    let roller = {
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                log.lock().await.roll(at(17, 0)).await?;
            }
            Ok::<_, StorageError>(())
        })
    };

    let mut appended = Vec::new();
    for writer in writers {
        appended.extend(writer.await??);
    }
    roller.await??;

    let log = log.lock().await;
    let archives = log.archives().await?;
    assert_eq!(archives.len(), 3);
    let mut stored = Vec::new();
    for archive in &archives {
        stored.extend(log.read_archive(&archive.name).await?.iter().map(|s| s.key));
    }
    stored.extend(log.query(0, usize::MAX).samples.iter().map(|s| s.key));

    let unique: HashSet<u64> = stored.iter().copied().collect();
    assert_eq!(unique.len(), stored.len(), "a sample was stored twice");
    stored.sort_unstable();
    appended.sort_unstable();
    assert_eq!(stored, appended);
    Ok(())
}
