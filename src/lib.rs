//! # Bedside Monitor Fleet Simulator
//!
//! Emulates a fleet of bedside patient monitors streaming MLLP-framed HL7
//! traffic to a central receiving hub, for load and integration testing.
//!
//! Each simulated bed keeps two independent connections to the hub:
//!
//! - a **vital-wave** feed carrying a vitals message and a waveform message
//!   every second
//! - an **alarm** feed carrying randomized alarm Start/End pairs
//!
//! Connections that drop are re-dialed automatically with a fixed
//! 30 s / 60 s backoff, and message generation never stalls while a feed is
//! down.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bedsim::{FleetOrchestrator, SimulatorConfig, TcpDialer, TemplateSet};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SimulatorConfig {
//!     send_alarms: false,
//!     ..SimulatorConfig::default()
//! };
//! let dialer = Arc::new(TcpDialer::new(config.address()));
//! let fleet = FleetOrchestrator::new(config, TemplateSet::builtin()?, None, dialer)?;
//!
//! let shutdown = CancellationToken::new();
//! let report = fleet.run(shutdown).await;
//! println!("{} beds sent {} frames", report.beds_started, report.vital_wave.frames_sent);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] - block framing and deframing
//! - [`connection`] - per-feed reconnect state machine, writer and drain tasks
//! - [`scheduler`] - fixed-cadence vitals/waveform producers
//! - [`alarms`] - alarm dictionary and Start/End event generator
//! - [`fleet`] - staggered bed creation and shutdown
//! - [`template`], [`message`], [`config`] - message bodies and startup settings

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::similar_names)]

pub mod alarms;
pub mod config;
pub mod connection;
pub mod fleet;
pub mod frame;
pub mod message;
pub mod scheduler;
pub mod template;

// Re-export main public types for convenience
pub use alarms::{AlarmDictionary, AlarmEventGenerator, Severity};
pub use config::{ConfigError, SimulatorConfig};
pub use connection::{Dialer, FeedConnection, FeedKind, FeedState, RetryPolicy, TcpDialer};
pub use fleet::{FleetOrchestrator, FleetReport, RampSchedule};
pub use frame::{encode_frame, FrameDecoder, FrameWriter};
pub use scheduler::PeriodicMessageScheduler;
pub use template::TemplateSet;
