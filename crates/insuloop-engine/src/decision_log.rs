//! Decision log for the loop pipeline.
//!
//! JSONL format, one record per prediction attempt, capturing the inputs,
//! any error, the projection, and the recommendation for offline review.
//! Writes go through a bounded channel drained by a background task so the
//! decision queue never blocks on disk.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use insuloop_core::{GlucoseSample, PredictedGlucose};
use serde::Serialize;
use tokio::sync::mpsc;

/// Effect availability at decision time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EffectsLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum_points: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carb_points: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insulin_points: Option<usize>,
}

/// Recommendation as issued (durations flattened for JSON).
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationLog {
    pub rate_units_per_hour: f64,
    pub duration_minutes: i64,
    pub issued_at: DateTime<Utc>,
}

/// Error summary for a failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    pub code: &'static str,
    pub detail: String,
}

/// Complete record of one prediction attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glucose: Option<GlucoseSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_status_at: Option<DateTime<Utc>>,
    pub effects: EffectsLog,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Vec<PredictedGlucose>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendationLog>,
}

/// Async decision logger with a bounded channel.
pub struct DecisionLogger {
    tx: mpsc::Sender<DecisionRecord>,
}

impl DecisionLogger {
    /// Create a logger writing `<run_id>_decisions.jsonl` under `log_dir`
    /// (created if needed), plus a small run manifest.
    pub fn new(log_dir: PathBuf, run_id: &str, buffer_size: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&log_dir)?;

        let log_file = log_dir.join(format!("{}_decisions.jsonl", run_id));
        let manifest_file = log_dir.join(format!("{}_manifest.json", run_id));

        let manifest = serde_json::json!({
            "run_id": run_id,
            "start_time": SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            "log_file": log_file.to_string_lossy(),
        });
        std::fs::write(&manifest_file, serde_json::to_string_pretty(&manifest)?)?;

        let file = OpenOptions::new().create(true).append(true).open(&log_file)?;

        let (tx, rx) = mpsc::channel(buffer_size);
        tokio::spawn(async move {
            Self::writer_task(rx, file).await;
        });

        tracing::info!("[DECISION_LOG] Logging to {:?}", log_file);

        Ok(Self { tx })
    }

    /// Enqueue a record. Drops (with a warning) rather than blocking the
    /// decision queue when the writer falls behind.
    pub fn log(&self, record: DecisionRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!("[DECISION_LOG] Dropped record: {}", e);
        }
    }

    async fn writer_task(mut rx: mpsc::Receiver<DecisionRecord>, file: File) {
        let mut writer = BufWriter::new(file);
        while let Some(record) = rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    if writeln!(writer, "{}", line).is_err() {
                        tracing::error!("[DECISION_LOG] Write failed, stopping logger");
                        return;
                    }
                }
                Err(e) => tracing::warn!("[DECISION_LOG] Serialize failed: {}", e),
            }
            // One flush per drained batch keeps tail latency bounded.
            if rx.is_empty() && writer.flush().is_err() {
                return;
            }
        }
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(at: DateTime<Utc>) -> DecisionRecord {
        DecisionRecord {
            at,
            glucose: None,
            pump_status_at: Some(at),
            effects: EffectsLog {
                momentum_points: Some(3),
                carb_points: None,
                insulin_points: Some(12),
            },
            error: Some(ErrorLog {
                code: "MISSING_DATA",
                detail: "carb store not available".to_string(),
            }),
            prediction: None,
            recommendation: None,
        }
    }

    #[tokio::test]
    async fn test_records_land_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DecisionLogger::new(dir.path().to_path_buf(), "test_run", 16).unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        logger.log(record(at));
        logger.log(record(at + chrono::Duration::minutes(5)));

        let log_path = dir.path().join("test_run_decisions.jsonl");
        let mut lines = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Ok(content) = std::fs::read_to_string(&log_path) {
                lines = content.lines().map(str::to_owned).collect();
                if lines.len() == 2 {
                    break;
                }
            }
        }
        assert_eq!(lines.len(), 2, "writer should have drained both records");

        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["error"]["code"], "MISSING_DATA");
        assert_eq!(parsed["effects"]["momentum_points"], 3);
        // Absent slots serialize as absent, not null.
        assert!(parsed["effects"].get("carb_points").is_none());

        let manifest = std::fs::read_to_string(dir.path().join("test_run_manifest.json")).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["run_id"], "test_run");
    }
}
