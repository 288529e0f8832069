//! # stagetrack-gateway
//!
//! Control-plane gateway for a UWB indoor tracking rig driving moving-head
//! stage lights. Anchor nodes report time-of-flight ranges to tags; the
//! gateway fuses them into 3-D positions at a fixed rate and synthesizes
//! per-fixture pan/tilt DMX output.
//!
//! ## Architecture
//!
//! Long-lived tokio workers around shared state:
//!   1. Ingestion task: parsed range batches → [`range_cache::RangeCache`]
//!   2. Tracking worker: periodic trilateration fixes per tag
//!   3. DMX worker: per-fixture pan/tilt → universe frames → output driver
//!   4. Calibration worker: spawned per run, collects bias samples
//!
//! The operational state machine ([`state::StateManager`]) gates which
//! mutations and which outputs are allowed at any moment. Persistence is a
//! JSON snapshot ([`store::Store`]); the message bus is out of process and
//! reached only through injected channels ([`publisher::Publisher`]).

pub mod calibration;
pub mod clock;
pub mod dmx;
pub mod events;
pub mod ingress;
pub mod publisher;
pub mod range_cache;
pub mod registry;
pub mod settings;
pub mod state;
pub mod store;
pub mod tracking;
pub mod trilateration;
