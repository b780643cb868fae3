//! Framed, half-duplex link to the relay gateway.
//!
//! Outbound frames are `[len][payload]`. To read, the host writes the header `[0][n]` and then reads back
//! `[available][n][payload]`, where `available` is how much more the gateway has buffered. A reply whose echoed
//! length differs from the requested one is an integrity failure; the only recovery is a full [`Bus::reset`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, ErrorKind};
use crate::Result;

/// Largest payload carried by one frame.
pub const MAX_FRAME_PAYLOAD: usize = 255;

/// How often a frame write is attempted before the failure is surfaced.
pub const TRANSMIT_ATTEMPTS: usize = 3;

/// Settings applied when the bus is (re)initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Bus clock in Hz
    pub clock_hz: u32,
    /// Per-transfer timeout
    pub timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings {
            clock_hz: 100_000,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// A point-to-point byte transport to the gateway, such as an I2C controller.
#[async_trait]
pub trait Bus: Send {
    /// Writes `bytes` to the gateway in one transfer.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads exactly `buf.len()` bytes from the gateway in one transfer.
    async fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Releases and reinitialises the transport. Must finish before any further transfer.
    async fn reset(&mut self, settings: &BusSettings) -> Result<()>;
}

/// Frame codec and request/response transactions over a [`Bus`].
#[derive(Debug)]
pub struct Link<B> {
    bus: B,
    settings: BusSettings,
    poll_budget: u32,
    poll_interval: Duration,
}

impl<B: Bus> Link<B> {
    /// Wraps a bus.
    pub fn new(bus: B, settings: BusSettings) -> Self {
        Link {
            bus,
            settings,
            poll_budget: 200,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Sets how many polls a transaction may spend waiting for its response, and the delay between empty polls.
    pub fn with_polling(mut self, budget: u32, interval: Duration) -> Self {
        self.poll_budget = budget;
        self.poll_interval = interval;
        self
    }

    /// The wrapped bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Sends one frame, retrying the whole frame on write errors.
    pub async fn transmit(&mut self, payload: &[u8]) -> Result<()> {
        let len = u8::try_from(payload.len()).map_err(|_| {
            Error::with_message(
                ErrorKind::InvalidParameter,
                format!("frame payload of {} bytes exceeds {MAX_FRAME_PAYLOAD}", payload.len()),
            )
        })?;
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(len);
        frame.extend_from_slice(payload);
        self.write_with_retry(&frame).await
    }

    /// Reads `buf.len()` bytes and returns how many more the gateway has buffered.
    ///
    /// A zero-length read only queries the buffered count. On an integrity failure `buf` is left untouched.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<u8> {
        let requested = u8::try_from(buf.len()).map_err(|_| {
            Error::with_message(
                ErrorKind::InvalidParameter,
                format!("cannot read {} bytes in one frame", buf.len()),
            )
        })?;
        self.write_with_retry(&[0, requested]).await?;

        let mut reply = vec![0u8; buf.len() + 2];
        self.bus.read(&mut reply).await?;
        let (available, echoed) = (reply[0], reply[1]);
        if echoed != requested {
            return Err(Error::with_message(
                ErrorKind::Integrity,
                format!("requested {requested} bytes, gateway returned {echoed}"),
            ));
        }
        buf.copy_from_slice(&reply[2..]);
        trace!(len = requested, available, "frame received");
        Ok(available)
    }

    /// Releases and reinitialises the bus.
    pub async fn reset(&mut self) -> Result<()> {
        warn!(clock_hz = self.settings.clock_hz, "resetting relay link");
        self.bus.reset(&self.settings).await
    }

    /// Sends a newline-terminated request and collects the newline-terminated response.
    ///
    /// A frame-level failure resets the link once and fails the transaction.
    pub async fn transaction(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let result = self.exchange(request).await;
        if let Err(err) = &result {
            if err.kind().is_link_failure() {
                if let Err(reset_err) = self.reset().await {
                    error!(%reset_err, "relay link reset failed");
                }
            }
        }
        result
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        for chunk in request.chunks(MAX_FRAME_PAYLOAD) {
            self.transmit(chunk).await?;
        }
        debug!(len = request.len(), "request sent");

        let mut response = Vec::new();
        let mut chunk = [0u8; MAX_FRAME_PAYLOAD];
        let mut available = 0usize;
        for _ in 0..self.poll_budget {
            if available == 0 {
                available = usize::from(self.receive(&mut []).await?);
                if available == 0 {
                    if response.ends_with(b"\n") {
                        return Ok(response);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            }

            let len = available.min(MAX_FRAME_PAYLOAD);
            available = usize::from(self.receive(&mut chunk[..len]).await?);
            response.extend_from_slice(&chunk[..len]);
            if available == 0 && response.ends_with(b"\n") {
                debug!(len = response.len(), "response received");
                return Ok(response);
            }
        }

        Err(Error::with_message(
            ErrorKind::Timeout,
            format!("no complete response after {} polls", self.poll_budget),
        ))
    }

    async fn write_with_retry(&mut self, frame: &[u8]) -> Result<()> {
        let mut last = None;
        for attempt in 1..=TRANSMIT_ATTEMPTS {
            match self.bus.write(frame).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, %err, "frame write failed");
                    last = Some(err);
                }
            }
        }
        Err(last.map_or_else(
            || ErrorKind::Bus.into(),
            |err| err.escalate(ErrorKind::Bus, "frame write failed"),
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::fake::ScriptedBus;
    use super::*;

    fn open(bus: ScriptedBus) -> Link<ScriptedBus> {
        Link::new(bus, BusSettings::default()).with_polling(20, Duration::ZERO)
    }

    #[tokio::test]
    async fn transmit_frames_payload() {
        let mut link = open(ScriptedBus::default());
        link.transmit(b"{}").await.unwrap();
        assert_eq!(link.bus().frames, vec![vec![2, b'{', b'}']]);

        let err = link.transmit(&[0u8; 256]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn transmit_retries_then_fails() {
        let bus = ScriptedBus {
            write_failures: 2,
            ..Default::default()
        };
        let mut link = open(bus);
        link.transmit(b"x").await.unwrap();

        let bus = ScriptedBus {
            write_failures: TRANSMIT_ATTEMPTS,
            ..Default::default()
        };
        let mut link = open(bus);
        let err = link.transmit(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bus);
        assert!(link.bus().frames.is_empty());
    }

    #[tokio::test]
    async fn receive_checks_echoed_length() {
        for len in [0usize, 1, 17, 255] {
            let mut bus = ScriptedBus::default();
            bus.queue((0..len).map(|i| i as u8).collect());
            let mut link = open(bus);
            let mut buf = vec![0u8; len];
            let available = link.receive(&mut buf).await.unwrap();
            assert_eq!(available, 0);
            assert_eq!(buf, (0..len).map(|i| i as u8).collect::<Vec<_>>());
        }

        let mut bus = ScriptedBus {
            corrupt_echo: true,
            ..Default::default()
        };
        bus.queue(vec![0xaa; 4]);
        let mut link = open(bus);
        let mut buf = [0u8; 4];
        let err = link.receive(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.to_string(), "incorrect amount of data: requested 4 bytes, gateway returned 5");
        assert_eq!(buf, [0u8; 4]);
    }

    #[tokio::test]
    async fn transaction_chunks_request_and_assembles_response() {
        let reply = format!("{{\"text\":\"{}\"}}\n", "r".repeat(300));
        let bus = ScriptedBus {
            replies: [reply.clone().into_bytes()].into(),
            ..Default::default()
        };
        let mut link = open(bus);

        let request = format!("{{\"req\":\"{}\"}}\n", "q".repeat(400));
        let response = link.transaction(request.as_bytes()).await.unwrap();
        assert_eq!(response, reply.as_bytes());

        let frames = &link.bus().frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(usize::from(frames[0][0]), MAX_FRAME_PAYLOAD);
        assert_eq!(link.bus().requests, vec![request.into_bytes()]);
    }

    #[tokio::test]
    async fn integrity_failure_resets_once() {
        let bus = ScriptedBus {
            replies: [b"{}\n".to_vec()].into(),
            corrupt_echo: true,
            ..Default::default()
        };
        let mut link = open(bus);
        let err = link.transaction(b"{\"req\":\"card.version\"}\n").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(link.bus().resets, 1);
    }

    #[tokio::test]
    async fn silent_gateway_times_out_without_reset() {
        let mut link = open(ScriptedBus::default());
        let err = link.transaction(b"{\"req\":\"card.version\"}\n").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(link.bus().resets, 0);
    }
}
