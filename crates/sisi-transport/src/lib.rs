//! # sisi-transport
//!
//! Device-facing transport and control plane.
//!
//! ## Architecture
//!
//! ```text
//!  device media ──tcp──► DeviceMediaListener ──audio──► MediaSink
//!                              │ <control>…</control>
//!                              ▼  (mixed_audio)
//!  control lane ──tcp──► ControlLaneListener ──► ControlCoordinator
//!        ▲                        (control_lane)    │ OrderingGuard
//!        │ "\n"                                     │ CapabilityCache
//!  control_ws bridge ◄── gateway /control           │ MetricsRecorder
//!  media_ws bridge   ◄── gateway /device            ▼
//!                                              RuntimeStatusStore ◄── HealthMonitor
//! ```
//!
//! [`TransportSupervisor`] starts the listeners, the WebSocket bridges and
//! the gateway front door from a [`TransportTopology`], then keeps the
//! [`RuntimeStatusStore`] current from a health monitor thread.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sisi_transport::{ControlCoordinator, TransportSupervisor, TransportTopology};
//!
//! let topology = TransportTopology::load(None).unwrap();
//! let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()));
//! supervisor.start().unwrap();
//! println!("{:?}", supervisor.runtime_status());
//! supervisor.stop();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod capability;
pub mod coordinator;
pub mod error;
pub mod framing;
pub mod listener;
pub mod metrics;
pub mod monitor;
pub mod ordering;
pub mod status;
pub mod supervisor;
pub mod topology;

// Re-export main types
pub use bridge::{BridgeConfig, SocketBridgeService, TrafficSnapshot};
pub use capability::{CapabilityCache, CapabilityFlags};
pub use coordinator::{
    ControlCoordinator, ControlKind, ControlOutcome, CoordinatorConfig, CoordinatorSnapshot,
    InterruptHooks, NoopInterruptHooks, SourceLane, WakeHitHandler,
};
pub use error::{TransportError, TransportResult};
pub use framing::{
    classify_media_chunk, ControlLaneExtractor, EmbeddedFrameExtractor, MediaChunk, Segment,
};
pub use listener::{
    ControlLaneListener, DeviceConnectionInfo, DeviceMediaListener, DiscardMediaSink, MediaSink,
    HEARTBEAT,
};
pub use metrics::{ControlMetrics, MetricsRecorder};
pub use monitor::HealthMonitor;
pub use ordering::{DropReason, OrderingGuard, Verdict};
pub use status::{
    DegradeReport, HealthReport, RuntimeStatus, RuntimeStatusStore, ServiceStatus, StatusSnapshot,
};
pub use supervisor::{GatewayRunner, SupervisorOptions, TransportSupervisor};
pub use topology::{select_bridge_target_port, TransportTopology};
