use crate::config::PipelineConfig;
use crate::checkpoint::MemoryCheckpointStore;
use crate::pipeline::{Pipeline, ShutdownFlag};
use crate::sink::analytical::MemoryAnalyticalStore;
use crate::sink::merge::MemoryMergeTable;
use crate::source::MemoryLog;
use crate::telemetry::RecordingAlertSink;
use anyhow::{Context, Result};
use serde_json::json;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Demo ticks driven by the binary before it reports telemetry.
const DEMO_TICKS: u32 = 5;

/// Application entrypoint: wires an in-memory source and stores, runs a few
/// trigger boundaries, and prints the telemetry snapshot. An optional config
/// file path may be passed as the first argument.
pub fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {path} is not valid JSON"))?;
            PipelineConfig::from_value(value).context("invalid pipeline config")?
        }
        None => PipelineConfig::default(),
    };

    let mut log = MemoryLog::new();
    for idx in 0..1_000u64 {
        log.append(
            "p0",
            json!({
                "principal_id": format!("principal-{}", idx % 800),
                "event_type": "session.start",
                "event_timestamp": 1_700_000_000_000i64 + idx as i64,
                "payload": { "seq": idx },
            }),
        );
    }

    let alerts = RecordingAlertSink::new();
    let alert_handle = alerts.handle();
    let mut pipeline = Pipeline::new(
        config.clone(),
        log,
        MemoryMergeTable::new(),
        MemoryAnalyticalStore::new(),
        MemoryCheckpointStore::new(),
        Box::new(alerts),
    );
    pipeline.recover().context("checkpoint recovery failed")?;

    let shutdown = ShutdownFlag::new();
    let start_ms = epoch_ms();
    let ticks =
        (0..u64::from(DEMO_TICKS)).map(|tick| start_ms + tick * config.trigger.interval_ms);
    pipeline
        .run_until(&shutdown, ticks)
        .context("pipeline tick failed")?;

    println!("{}", serde_json::to_string_pretty(pipeline.telemetry())?);
    for alert in alert_handle.borrow().iter() {
        eprintln!("alert: {}", serde_json::to_string(alert)?);
    }
    Ok(())
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
