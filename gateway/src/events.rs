//! Append-only, SHA-256 chained event log.
//!
//! Every operationally relevant event (state transition, calibration
//! lifecycle, DMX fault, calibration invalidation) is appended as a block
//! that hashes the previous block's hash. Tampering with any line breaks the
//! chain, which `verify` detects. Write failures are logged and never crash
//! the emitting worker.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One block in the chained log. The original row shape
/// (level/source/event_type/ref/details) travels inside the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBlock {
    pub seq: u64,
    pub ts_ms: u64,
    pub level: EventLevel,
    /// Emitting subsystem, e.g. "state", "dmx", "calibration".
    pub source: String,
    pub event_type: String,
    /// Identifier of the affected entity (MAC, run id, universe), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub block_hash: String,
}

impl EventBlock {
    fn compute_hash(
        prev_hash: &str,
        ts_ms: u64,
        source: &str,
        event_type: &str,
        details: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(ts_ms.to_le_bytes());
        hasher.update(source.as_bytes());
        hasher.update(event_type.as_bytes());
        hasher.update(details.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify this block's hash is internally consistent.
    pub fn verify(&self) -> bool {
        Self::compute_hash(
            &self.prev_hash,
            self.ts_ms,
            &self.source,
            &self.event_type,
            &self.details,
        ) == self.block_hash
    }
}

#[derive(Default)]
struct ChainState {
    seq: u64,
    last_hash: String,
}

/// Thread-safe, append-only event logger writing JSON lines.
#[derive(Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
    state: Arc<Mutex<ChainState>>,
}

impl EventLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(ChainState {
                seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
        }
    }

    /// Append one event block. The single write path.
    pub async fn append(
        &self,
        level: EventLevel,
        source: &str,
        event_type: &str,
        ref_id: Option<&str>,
        details: serde_json::Value,
    ) {
        let ts_ms = clock::now_ms();
        let block = {
            let mut state = self.state.lock().await;
            let block_hash =
                EventBlock::compute_hash(&state.last_hash, ts_ms, source, event_type, &details);
            let block = EventBlock {
                seq: state.seq,
                ts_ms,
                level,
                source: source.to_string(),
                event_type: event_type.to_string(),
                ref_id: ref_id.map(str::to_string),
                details,
                prev_hash: state.last_hash.clone(),
                block_hash,
            };
            state.last_hash = block.block_hash.clone();
            state.seq += 1;
            block
        };

        debug_assert!(block.verify());

        let line = match serde_json::to_string(&block) {
            Ok(l) => format!("{l}\n"),
            Err(e) => {
                warn!("events: failed to serialize block: {e}");
                return;
            }
        };

        let Some(path) = &self.path else {
            info!(
                "event[{}] {}/{} {}",
                block.seq,
                block.source,
                block.event_type,
                block.ref_id.as_deref().unwrap_or("-")
            );
            return;
        };

        match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("events: write failed: {e}");
                }
            }
            Err(e) => {
                warn!("events: could not open {}: {e}", path.display());
            }
        }
    }

    pub async fn state_changed(&self, from: &str, to: &str, reason: Option<&str>) {
        self.append(
            EventLevel::Info,
            "state",
            "state_changed",
            None,
            serde_json::json!({ "from": from, "to": to, "reason": reason }),
        )
        .await;
    }

    pub async fn dmx_fault(&self, universe: u16, error: &str) {
        self.append(
            EventLevel::Error,
            "dmx",
            "send_failed",
            Some(&universe.to_string()),
            serde_json::json!({ "error": error }),
        )
        .await;
    }

    pub async fn calibration_event(&self, event_type: &str, run_id: i64, details: serde_json::Value) {
        self.append(
            EventLevel::Info,
            "calibration",
            event_type,
            Some(&run_id.to_string()),
            details,
        )
        .await;
    }

    pub async fn calibration_invalidated(&self, touched: usize, reason: &str) {
        self.append(
            EventLevel::Warn,
            "calibration",
            "calibration_invalidated",
            None,
            serde_json::json!({ "runs": touched, "reason": reason }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(Some(path.clone()));

        log.append(EventLevel::Info, "state", "state_changed", None, json!({"to": "LIVE"}))
            .await;
        log.dmx_fault(0, "io error").await;

        let raw = std::fs::read_to_string(&path).unwrap();
        let blocks: Vec<EventBlock> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].prev_hash, GENESIS_HASH);
        assert_eq!(blocks[1].prev_hash, blocks[0].block_hash);
        assert!(blocks.iter().all(EventBlock::verify));
    }

    #[tokio::test]
    async fn tampering_breaks_verification() {
        let log = EventLog::new(None);
        log.append(EventLevel::Info, "t", "e", None, json!({})).await;

        let mut block = EventBlock {
            seq: 0,
            ts_ms: 1,
            level: EventLevel::Info,
            source: "state".into(),
            event_type: "state_changed".into(),
            ref_id: None,
            details: json!({"to": "LIVE"}),
            prev_hash: GENESIS_HASH.into(),
            block_hash: String::new(),
        };
        block.block_hash =
            EventBlock::compute_hash(&block.prev_hash, block.ts_ms, &block.source, &block.event_type, &block.details);
        assert!(block.verify());

        block.details = json!({"to": "SAFE"});
        assert!(!block.verify());
    }
}
