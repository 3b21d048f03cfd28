//! # sisi-gateway-server
//!
//! WebSocket front door for Sisi devices and apps.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   /device    ┌─────────────────┐    ws    ┌───────────────┐
//! │    device    │◄────────────►│  GatewayServer  │◄────────►│ media backend │
//! └──────────────┘              │                 │          └───────────────┘
//!                               │  ┌───────────┐  │
//! ┌──────────────┐   /control   │  │ Session-  │  │  one-shot ┌─────────────────┐
//! │  app client  │─────────────►│  │ Registry  │  │──────────►│ control backend │
//! └──────────────┘              │  └───────────┘  │           └─────────────────┘
//!                               └─────────────────┘
//! ```
//!
//! Every connection is authenticated before routing (see [`auth`]). The
//! `/device` route holds one media backend connection per client and
//! acknowledges control payloads it recognizes. The `/control` route opens a
//! fresh backend connection per message and reports the outcome in a
//! `control_ack`.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use sisi_gateway_server::{GatewayConfig, GatewayServer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = GatewayConfig::new("0.0.0.0", 9102).with_access_token("secret");
//!     let server = GatewayServer::new(config).unwrap();
//!     server.run_forever().await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod session;

// Re-export main types
pub use auth::{authorize, check_token, resolve_token, AuthDecision, ConnectRequest};
pub use config::{GatewayConfig, DEFAULT_MAX_MESSAGE_BYTES};
pub use error::{ServerError, ServerResult};
pub use handlers::{forward_control, Route, CONTROL_TEXT_ONLY, DEFAULT_DEVICE_ID};
pub use server::{GatewayServer, ShutdownHandle};
pub use session::{Session, SessionRegistry};
