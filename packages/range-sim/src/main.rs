//! main.rs — StageTrack range simulator entry point.
//!
//! Emits synthetic per-anchor range batches over UDP at a fixed rate so the
//! gateway's full pipeline (ingest → trilateration → DMX) can run without a
//! single piece of UWB hardware. Fault toggles cover the interesting cases:
//! a silenced anchor and an uncalibrated range bias.

mod tx;
mod world;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::interval;
use tracing::info;

use uwb_wire::{RangeBatch, RangeEntry};

use tx::BatchTransmitter;
use world::World;

#[derive(Parser, Debug)]
#[command(name = "range-sim", about = "StageTrack synthetic UWB rig simulator")]
struct Args {
    /// Gateway ingress address
    #[arg(long, default_value = "127.0.0.1:5808")]
    gateway: String,
    /// Number of anchors (corner-first placement)
    #[arg(long, default_value = "4")]
    anchors: usize,
    /// Number of tags on the path
    #[arg(long, default_value = "1")]
    tags: usize,
    /// Batches per anchor per second
    #[arg(long, default_value = "10.0")]
    rate: f64,
    /// Gaussian range noise, centimeters (1σ)
    #[arg(long, default_value = "3.0")]
    noise_cm: f64,
    /// Venue width / depth / anchor height, centimeters
    #[arg(long, default_value = "1200.0")]
    width_cm: f64,
    #[arg(long, default_value = "900.0")]
    depth_cm: f64,
    #[arg(long, default_value = "350.0")]
    height_cm: f64,
    /// Silence this anchor index (dropout fault)
    #[arg(long)]
    drop_anchor: Option<usize>,
    /// Add a constant range bias to anchor 0, centimeters
    #[arg(long, default_value = "0.0")]
    bias_cm: f64,
    /// RNG seed for reproducible runs
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "range_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut world = World::new(
        args.anchors,
        args.tags,
        args.width_cm,
        args.depth_cm,
        args.height_cm,
    );
    let transmitter = BatchTransmitter::new(&args.gateway).expect("failed to bind udp socket");
    let mut rng = StdRng::seed_from_u64(args.seed);

    info!(
        "range-sim: {} anchors, {} tags → {} at {} Hz (noise {} cm)",
        args.anchors, args.tags, args.gateway, args.rate, args.noise_cm
    );
    for anchor in &world.anchors {
        info!(
            "  anchor {} at ({:.0}, {:.0}, {:.0}) cm",
            anchor.mac, anchor.pos.x, anchor.pos.y, anchor.pos.z
        );
    }

    let period = Duration::from_secs_f64(1.0 / args.rate.clamp(0.1, 100.0));
    let mut ticker = interval(period);
    let mut epoch: u64 = 0;
    loop {
        ticker.tick().await;
        world.step(period.as_secs_f64());
        epoch += 1;

        let ts_ms = now_ms();
        let tag_positions: Vec<_> = world
            .tags
            .iter()
            .map(|tag| (tag.mac.clone(), world.tag_position(tag)))
            .collect();

        for (i, anchor) in world.anchors.iter().enumerate() {
            if args.drop_anchor == Some(i) {
                continue;
            }
            let bias = if i == 0 { args.bias_cm } else { 0.0 };
            let ranges = tag_positions
                .iter()
                .map(|(tag_mac, pos)| RangeEntry {
                    tag_mac: Some(tag_mac.to_string()),
                    d_m: Some(world.measure_m(anchor, pos, args.noise_cm, bias, &mut rng)),
                    distance_mm: None,
                    q: Some(0.9),
                    ts_ms: None,
                })
                .collect();
            transmitter.send(&RangeBatch {
                anchor_mac: anchor.mac.clone(),
                ts_ms,
                ranges,
            });
        }

        if epoch % (args.rate as u64).max(1) == 0 {
            let (tag, pos) = &tag_positions[0];
            info!(
                "epoch {epoch}: tag {} at ({:.0}, {:.0}, {:.0}) cm",
                tag, pos.x, pos.y, pos.z
            );
        }
    }
}
