//! # Avionics Bus
//!
//! A deterministic publish/subscribe message bus for flight software, with a
//! cyclic executive, fault detection, isolation and recovery, triple modular
//! redundancy voting and Kalman-filter state estimation.
//!
//! ## Features
//!
//! - **Typed topics**: QoS class, criticality, schema and bounded queues per topic
//! - **Cyclic executive**: fixed frames, rate-monotonic order, budget enforcement
//! - **FDIR**: per-node health state machine with quarantine, restart and backoff
//! - **TMR voting**: discrete majority or continuous median for replicated producers
//! - **State estimation**: linear Kalman filter with PSD and divergence checks
//! - **Mission clock**: monotonic time with relativistic dilation correction
//! - **Bounded memory**: fixed-capacity registries and queues after configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use avbus::{FlightExecutive, ManualTime, MissionConfig};
//!
//! let config = MissionConfig::from_file("profiles/demo.json").unwrap();
//! let mut executive = FlightExecutive::from_config(&config, ManualTime::new()).unwrap();
//! // attach a FlightNode for every declared node, then:
//! executive.start().unwrap();
//! let report = executive.run_frame().unwrap();
//! println!("frame {} executed {} nodes", report.frame, report.executed);
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Topic registry, bounded queues and delivery
//! - [`node`] - Node registry and the [`FlightNode`] interface
//! - [`scheduler`] - Cyclic frame scheduler and schedulability analysis
//! - [`voter`] - Replica-group voting
//! - [`fdir`] - Health monitoring and recovery policy
//! - [`estimator`] - Kalman filter and the estimator node
//! - [`clock`] - Mission time and dilation correction
//! - [`executive`] - The frame loop tying everything together
//! - [`telemetry`] - Read-only mission snapshots

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod estimator;
pub mod executive;
pub mod fault;
pub mod fault_injection;
pub mod fdir;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod telemetry;
pub mod voter;

// Re-export main public types for convenience
pub use bus::{Criticality, MessageBus, QosClass, TopicHandle, TopicSpec};
pub use clock::{ManualTime, MissionClock, MonotonicTime, TimeSource};
pub use config::MissionConfig;
pub use error::{BusError, BusResult};
pub use executive::{FlightExecutive, FrameReport};
pub use node::{FlightNode, NodeContext};
pub use protocol::{Confidence, FaultClass, HealthStatus, Message, MissionTime, NodeId, TopicId};
pub use telemetry::TelemetrySnapshot;
