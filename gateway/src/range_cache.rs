//! Latest-sample cache for (tag, anchor) range measurements.
//!
//! The only hot concurrent structure in the gateway: every ingestion task
//! writes into it and the tracking and calibration workers snapshot from it.
//! One coarse mutex is enough at UWB rates; it is never held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use uwb_wire::{Mac, RangeBatch};

/// One retained distance measurement, meters.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSample {
    pub anchor_mac: Mac,
    pub tag_mac: Mac,
    pub d_m: f64,
    pub ts_ms: u64,
    pub quality: Option<f64>,
}

pub struct RangeCache {
    window_ms: u64,
    samples: Mutex<HashMap<(Mac, Mac), RangeSample>>,
}

impl RangeCache {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one anchor batch. Entries without a tag or a parseable distance
    /// are dropped silently; a cell is replaced only when the incoming
    /// timestamp is at least as new as the stored one. Expired cells are
    /// pruned on the way out.
    pub fn ingest(&self, batch: &RangeBatch, now_ms: u64) {
        let batch_ts = batch.normalized_ts(now_ms);
        let mut samples = self.samples.lock().unwrap();
        for entry in &batch.ranges {
            let (Some(tag), Some(d_m)) = (entry.tag(), entry.distance_m()) else {
                continue;
            };
            let ts_ms = entry.ts_ms.unwrap_or(batch_ts);
            let key = (tag.clone(), batch.anchor_mac.clone());
            let fresh = samples.get(&key).is_none_or(|prev| ts_ms >= prev.ts_ms);
            if fresh {
                samples.insert(
                    key,
                    RangeSample {
                        anchor_mac: batch.anchor_mac.clone(),
                        tag_mac: tag,
                        d_m,
                        ts_ms,
                        quality: entry.q,
                    },
                );
            }
        }
        let cutoff = now_ms.saturating_sub(self.window_ms);
        samples.retain(|_, s| s.ts_ms >= cutoff);
    }

    /// Fresh samples for one tag: at most one per anchor, none older than
    /// `max_age_ms`. Order is unspecified.
    pub fn snapshot(&self, tag: &Mac, max_age_ms: u64, now_ms: u64) -> Vec<RangeSample> {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), s)| t == tag && s.ts_ms >= cutoff)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Tags with at least one sample still inside the freshness window.
    /// Pruning is eager on ingest, so a quiet cache can hold expired cells;
    /// they do not count as known here.
    pub fn known_tags(&self, now_ms: u64) -> Vec<Mac> {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let samples = self.samples.lock().unwrap();
        let mut tags: Vec<Mac> = samples
            .iter()
            .filter(|(_, s)| s.ts_ms >= cutoff)
            .map(|((tag, _), _)| tag.clone())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}
