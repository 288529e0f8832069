//! Range-batch ingestion.
//!
//! The core consumes *parsed* batches from an injected channel; whoever owns
//! the bus connection (MQTT sidecar, the UDP ingress below, a test) feeds it.
//! The ingestion task keeps device last-seen current and writes the range
//! cache; a batch is never allowed to take the task down.
//!
//! The UDP ingress is the local/dev transport: one JSON [`RangeBatch`] per
//! datagram, straight off the anchors' Wi-Fi uplink (or `range-sim`).

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use uwb_wire::RangeBatch;

use crate::clock;
use crate::range_cache::RangeCache;
use crate::state::StateManager;
use crate::store::{DeviceRole, Store};

/// Default UDP port for the JSON range-batch ingress.
pub const DEFAULT_UDP_PORT: u16 = 5808;

/// Apply one parsed batch: cache cells plus device bookkeeping for the
/// reporting anchor and every tag it ranged.
pub async fn apply_batch(batch: &RangeBatch, cache: &RangeCache, store: &Store) {
    let now_ms = clock::now_ms();
    cache.ingest(batch, now_ms);

    let seen_ts = batch.normalized_ts(now_ms);
    store
        .device_seen(&batch.anchor_mac, DeviceRole::Anchor, seen_ts)
        .await;
    for entry in &batch.ranges {
        if let Some(tag) = entry.tag() {
            store.device_seen(&tag, DeviceRole::Tag, seen_ts).await;
        }
    }
}

/// Ingestion fiber: drains the injected channel until shutdown.
pub async fn run_ingest(
    mut rx: mpsc::Receiver<RangeBatch>,
    cache: Arc<RangeCache>,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => apply_batch(&batch, &cache, &store).await,
                None => break, // all senders gone
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("ingestion stopped");
}

/// UDP listener: parses datagrams into batches and feeds the ingestion
/// channel. Binding failure is logged and the task ends (no hardware in this
/// setup); receive errors never kill the loop.
pub async fn run_udp_ingress(
    port: u16,
    tx: mpsc::Sender<RangeBatch>,
    state: Arc<StateManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = format!("0.0.0.0:{port}");
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => {
            info!("range ingress listening on udp {addr}");
            state.set_bus_connected(true);
            s
        }
        Err(e) => {
            warn!("range ingress: could not bind udp {addr}: {e}");
            return;
        }
    };

    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    match serde_json::from_slice::<RangeBatch>(&buf[..len]) {
                        Ok(batch) => {
                            if tx.try_send(batch).is_err() {
                                warn!("range ingress: ingestion channel full, dropping batch");
                            }
                        }
                        Err(e) => debug!("range ingress: malformed datagram from {src}: {e}"),
                    }
                }
                Err(e) => warn!("range ingress: udp recv error: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    state.set_bus_connected(false);
    info!("range ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uwb_wire::{Mac, RangeEntry};

    fn mac(s: &str) -> Mac {
        Mac::parse(s).unwrap()
    }

    #[tokio::test]
    async fn batch_updates_cache_and_device_rows() {
        let store = Store::in_memory();
        let cache = RangeCache::new(60_000);
        let batch = RangeBatch {
            anchor_mac: mac("aabbccddee01"),
            ts_ms: 0, // uptime, replaced with now
            ranges: vec![RangeEntry {
                tag_mac: Some("11:22:33:44:55:01".into()),
                d_m: Some(2.5),
                distance_mm: None,
                q: None,
                ts_ms: None,
            }],
        };

        apply_batch(&batch, &cache, &store).await;

        let now = clock::now_ms();
        let snap = cache.snapshot(&mac("112233445501"), 5_000, now);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].d_m, 2.5);

        let devices = store.list_devices().await;
        assert_eq!(devices.len(), 2);
        let roles: Vec<_> = devices.iter().filter_map(|(_, row)| row.role).collect();
        assert!(roles.contains(&DeviceRole::Anchor));
        assert!(roles.contains(&DeviceRole::Tag));
        // uptime timestamp was replaced, so last-seen is wall-clock
        assert!(devices.iter().all(|(_, row)| row.last_seen_at_ms > 1_000_000_000_000));
    }

    #[tokio::test]
    async fn ingest_channel_drains_until_closed() {
        let store = Store::in_memory();
        let cache = Arc::new(RangeCache::new(60_000));
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_ingest(rx, cache.clone(), store.clone(), shutdown_rx));

        tx.send(RangeBatch {
            anchor_mac: mac("aabbccddee01"),
            ts_ms: 0,
            ranges: vec![RangeEntry {
                tag_mac: Some("112233445501".into()),
                d_m: Some(1.0),
                distance_mm: None,
                q: None,
                ts_ms: None,
            }],
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(cache.known_tags(clock::now_ms()).len(), 1);
    }
}
