#![allow(dead_code)]

use async_trait::async_trait;
use bedsim::connection::{BoxedStream, Dialer};
use bedsim::message::BedId;
use bedsim::template::{Template, TemplateKind, TemplateSet};
use bedsim::FrameDecoder;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const HUB_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Accept,
    Refuse,
    /// Accept once the dial has been in flight for the given time.
    SlowAccept(Duration),
}

/// In-memory hub. Accepted dials hand the hub side of a duplex pipe to the
/// test through `hub_ends`.
pub struct TestHub {
    script: Mutex<VecDeque<DialOutcome>>,
    fallback: DialOutcome,
    dials: Mutex<Vec<Instant>>,
    hub_tx: mpsc::UnboundedSender<DuplexStream>,
}

impl TestHub {
    pub fn new(
        script: Vec<DialOutcome>,
        fallback: DialOutcome,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            dials: Mutex::new(Vec::new()),
            hub_tx,
        });
        (hub, hub_rx)
    }

    pub fn always(outcome: DialOutcome) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::new(Vec::new(), outcome)
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialer for TestHub {
    async fn dial(&self) -> io::Result<BoxedStream> {
        self.dials.lock().unwrap().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        if let DialOutcome::SlowAccept(delay) = outcome {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            DialOutcome::Refuse => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "hub unreachable",
            )),
            DialOutcome::Accept | DialOutcome::SlowAccept(_) => {
                let (client, hub) = tokio::io::duplex(HUB_BUFFER);
                // Receiver may be gone once a test stops watching connections
                let _ = self.hub_tx.send(hub);
                Ok(Box::new(client))
            }
        }
    }
}

/// Small templates that are easy to pick apart in assertions.
pub fn test_templates() -> TemplateSet {
    TemplateSet {
        vitals: Template::parse(
            TemplateKind::Vitals,
            "VITALS|{{.Unit}}|{{.Bed}}|{{.PatientLast}}^{{.PatientFirst}}|{{.Datetime}}",
        )
        .unwrap(),
        waveform: Template::parse(
            TemplateKind::Waveform,
            "WAVE|{{.Unit}}|{{.Bed}}|{{.DatetimeSub1}}",
        )
        .unwrap(),
        alarm: Template::parse(
            TemplateKind::Alarm,
            "ALARM|{{.Bed}}|{{.AlarmCode}}|{{.AlarmText}}|{{.AlarmLevel}}|{{.Start}}|{{.Active}}",
        )
        .unwrap(),
    }
}

pub fn bed(index: usize) -> BedId {
    BedId::from_index("LABMR", index)
}

/// Read from `hub` until `count` frames have been decoded.
pub async fn read_frames(
    hub: &mut DuplexStream,
    decoder: &mut FrameDecoder,
    count: usize,
) -> Vec<String> {
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 4096];
    while frames.len() < count {
        let n = hub.read(&mut buf).await.expect("hub read");
        assert!(n > 0, "stream closed after {} frames", frames.len());
        frames.extend(
            decoder
                .push(&buf[..n])
                .into_iter()
                .map(|body| String::from_utf8(body).unwrap()),
        );
    }
    frames
}

/// Read raw bytes from `hub` for `window` of (virtual) time.
pub async fn read_for(hub: &mut DuplexStream, window: Duration) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + window;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return raw,
            read = hub.read(&mut buf) => match read {
                Ok(0) | Err(_) => return raw,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
            },
        }
    }
}

pub fn assert_within(actual: Duration, expected: Duration, tolerance: Duration) {
    assert!(
        actual >= expected && actual <= expected + tolerance,
        "expected {expected:?} (+{tolerance:?}), got {actual:?}"
    );
}
