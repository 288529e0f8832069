//! Pluggable DMX output transports.
//!
//! Three variants behind one trait: UART RS-485 (the classic single-universe
//! DMX-512 wire), Art-Net over UDP, and Off. Each driver carries the config
//! it was built from so the engine can detect settings changes and swap the
//! instance instead of reopening the port every tick.

use std::io::Write;
use std::net::UdpSocket;
use std::time::Duration;

use serialport::SerialPort;
use tracing::debug;

use crate::settings::ArtnetTarget;

use super::frame::Frame;

#[derive(Debug, thiserror::Error)]
pub enum DmxError {
    #[error("serial: {0}")]
    Serial(#[from] serialport::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Which transport to run, resolved from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverConfig {
    Off,
    Uart { device: String },
    Artnet { target: ArtnetTarget },
}

pub trait DmxOutput: Send {
    /// Emit one universe frame. `universe` is the fixture-local universe id;
    /// transports that cannot address universes ignore it.
    fn send_frame(&mut self, frame: &Frame, universe: u16) -> Result<(), DmxError>;

    /// The config this driver was built from, compared against freshly
    /// resolved settings to decide whether a rebuild is due.
    fn config(&self) -> &DriverConfig;
}

/// Build the driver for a config. Opening can fail (missing serial device);
/// the engine retries on the next tick.
pub fn open(config: DriverConfig) -> Result<Box<dyn DmxOutput>, DmxError> {
    match &config {
        DriverConfig::Off => Ok(Box::new(NullDmx { config })),
        DriverConfig::Uart { device } => {
            let port = serialport::new(device, 250_000)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::Two)
                .timeout(Duration::from_millis(100))
                .open()?;
            Ok(Box::new(UartDmx { config, port }))
        }
        DriverConfig::Artnet { target } => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_broadcast(true)?;
            let dest = (target.ip, target.port);
            let universe_base = target.universe_base;
            Ok(Box::new(ArtnetDmx {
                config,
                socket,
                dest,
                universe_base,
                sequence: 1,
            }))
        }
    }
}

// ── Off ───────────────────────────────────────────────────────────────────────

struct NullDmx {
    config: DriverConfig,
}

impl DmxOutput for NullDmx {
    fn send_frame(&mut self, _frame: &Frame, _universe: u16) -> Result<(), DmxError> {
        Ok(())
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

// ── UART RS-485 ───────────────────────────────────────────────────────────────

/// DMX-512 on the wire: 250 kbit/s 8N2, each frame preceded by a break of at
/// least 88 µs and a mark-after-break of at least 8 µs. Single universe.
struct UartDmx {
    config: DriverConfig,
    port: Box<dyn SerialPort>,
}

impl DmxOutput for UartDmx {
    fn send_frame(&mut self, frame: &Frame, _universe: u16) -> Result<(), DmxError> {
        self.port.set_break()?;
        std::thread::sleep(Duration::from_micros(100)); // break ≥ 88 µs
        self.port.clear_break()?;
        std::thread::sleep(Duration::from_micros(12)); // MAB ≥ 8 µs
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

// ── Art-Net ───────────────────────────────────────────────────────────────────

/// ArtDMX sequence numbers wrap 1..=255 and never touch 0 (0 disables
/// sequence tracking on receivers).
pub(crate) fn next_seq(seq: u8) -> u8 {
    if seq == 255 {
        1
    } else {
        seq + 1
    }
}

/// Build one ArtDMX packet: the 512 data bytes travel without the DMX start
/// code, which Art-Net carries implicitly.
pub(crate) fn artdmx_packet(sequence: u8, universe: u16, frame: &Frame) -> Vec<u8> {
    let data = &frame[1..];
    let mut pkt = Vec::with_capacity(18 + data.len());
    pkt.extend_from_slice(b"Art-Net\0");
    pkt.extend_from_slice(&[0x00, 0x50]); // OpDmx, little-endian
    pkt.extend_from_slice(&[0x00, 0x0E]); // protocol 14, big-endian
    pkt.push(sequence);
    pkt.push(0x00); // physical input port
    pkt.extend_from_slice(&universe.to_le_bytes());
    pkt.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pkt.extend_from_slice(data);
    pkt
}

struct ArtnetDmx {
    config: DriverConfig,
    socket: UdpSocket,
    dest: (std::net::IpAddr, u16),
    universe_base: u16,
    sequence: u8,
}

impl DmxOutput for ArtnetDmx {
    fn send_frame(&mut self, frame: &Frame, universe: u16) -> Result<(), DmxError> {
        let wire_universe = self.universe_base.wrapping_add(universe);
        let pkt = artdmx_packet(self.sequence, wire_universe, frame);
        self.socket.send_to(&pkt, self.dest)?;
        debug!(
            "artnet: seq {} universe {} → {}:{}",
            self.sequence, wire_universe, self.dest.0, self.dest.1
        );
        self.sequence = next_seq(self.sequence);
        Ok(())
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmx::frame::FRAME_LEN;

    #[test]
    fn artdmx_packet_layout() {
        let mut frame = [0u8; FRAME_LEN];
        frame[1] = 0xAA;
        frame[512] = 0xBB;
        let pkt = artdmx_packet(7, 0x0102, &frame);

        assert_eq!(&pkt[0..8], b"Art-Net\0");
        assert_eq!(&pkt[8..10], &[0x00, 0x50]); // opcode LE
        assert_eq!(&pkt[10..12], &[0x00, 0x0E]); // protocol BE
        assert_eq!(pkt[12], 7); // sequence
        assert_eq!(pkt[13], 0); // physical
        assert_eq!(&pkt[14..16], &[0x02, 0x01]); // universe LE
        assert_eq!(&pkt[16..18], &[0x02, 0x00]); // length 512 BE
        assert_eq!(pkt.len(), 18 + 512);
        assert_eq!(pkt[18], 0xAA); // first data byte, start code stripped
        assert_eq!(pkt[18 + 511], 0xBB);
    }

    #[test]
    fn sequence_wraps_one_to_255_skipping_zero() {
        let mut seq = 1u8;
        let mut seen = Vec::new();
        for _ in 0..510 {
            seen.push(seq);
            seq = next_seq(seq);
        }
        assert!(!seen.contains(&0));
        assert_eq!(seen[0], 1);
        assert_eq!(seen[254], 255);
        assert_eq!(seen[255], 1); // wrapped
    }

    #[test]
    fn artnet_driver_emits_to_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let target = ArtnetTarget {
            ip: addr.ip(),
            port: addr.port(),
            universe_base: 10,
        };
        let mut driver = open(DriverConfig::Artnet { target }).unwrap();

        let mut frame = [0u8; FRAME_LEN];
        frame[1] = 0x55;
        driver.send_frame(&frame, 2).unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, 18 + 512);
        assert_eq!(&buf[0..8], b"Art-Net\0");
        assert_eq!(&buf[14..16], &12u16.to_le_bytes()); // base 10 + universe 2
        assert_eq!(buf[18], 0x55);
    }

    #[test]
    fn off_driver_swallows_frames() {
        let mut driver = open(DriverConfig::Off).unwrap();
        assert!(driver.send_frame(&[0u8; FRAME_LEN], 0).is_ok());
        assert_eq!(driver.config(), &DriverConfig::Off);
    }

    #[test]
    fn config_comparison_detects_mode_changes() {
        let uart = DriverConfig::Uart {
            device: "/dev/serial0".into(),
        };
        let uart_other = DriverConfig::Uart {
            device: "/dev/ttyUSB0".into(),
        };
        assert_ne!(uart, uart_other);
        assert_ne!(uart, DriverConfig::Off);
    }
}
