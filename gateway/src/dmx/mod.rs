//! DMX output stack: geometry→angle mapping, universe frame assembly, the
//! pluggable wire drivers, and the engine that ticks them at `dmx_hz`.

pub mod driver;
pub mod engine;
pub mod frame;
pub mod mapping;
