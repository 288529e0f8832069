//! tx.rs — UDP transmitter for range batches.
//!
//! One JSON [`RangeBatch`] per datagram, exactly the envelope the gateway's
//! ingress parses. Send errors are logged and never stop the simulation.

use std::net::UdpSocket;

use tracing::{debug, warn};

use uwb_wire::RangeBatch;

pub struct BatchTransmitter {
    socket: UdpSocket,
    gateway_addr: String,
}

impl BatchTransmitter {
    pub fn new(gateway_addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            gateway_addr: gateway_addr.to_string(),
        })
    }

    pub fn send(&self, batch: &RangeBatch) {
        let bytes = match serde_json::to_vec(batch) {
            Ok(b) => b,
            Err(e) => {
                warn!("tx: serialize failed: {e}");
                return;
            }
        };
        match self.socket.send_to(&bytes, &self.gateway_addr) {
            Ok(_) => debug!(
                "tx: {} ranges from {} → {}",
                batch.ranges.len(),
                batch.anchor_mac,
                self.gateway_addr
            ),
            Err(e) => warn!("tx: send failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uwb_wire::{Mac, RangeEntry};

    #[test]
    fn datagram_round_trips_through_the_wire_shape() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let tx = BatchTransmitter::new(&addr.to_string()).unwrap();
        tx.send(&RangeBatch {
            anchor_mac: Mac::parse("aabbccddee00").unwrap(),
            ts_ms: 1_700_000_000_000,
            ranges: vec![RangeEntry {
                tag_mac: Some("112233445F00".into()),
                d_m: Some(3.21),
                distance_mm: None,
                q: Some(0.9),
                ts_ms: None,
            }],
        });

        let mut buf = [0u8; 4096];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let parsed: RangeBatch = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(parsed.anchor_mac.as_str(), "AABBCCDDEE00");
        assert_eq!(parsed.ranges[0].distance_m(), Some(3.21));
    }
}
