//! Client library for the SNAPPY measurement daemon.
//!
//! The daemon runs locally and binds one loopback TCP port in the range
//! 8436-8535, chosen at startup. This crate discovers it, holds a
//! persistent monitored connection to it, and exposes its command
//! surface and push-event streams.
//!
//! Layering, bottom up:
//!
//! - [`locator`]: port scan + `version` handshake discovery
//! - [`channel`]: one persistent WebSocket with call correlation and
//!   push-event fan-out
//! - [`supervisor`]: health monitoring and automatic recovery above
//!   the channel
//! - [`link`]: the [`SnappyLink`] facade applications hold
//!
//! ```no_run
//! use snappy_client::{LinkConfig, SnappyLink};
//!
//! # async fn demo() {
//! let link = SnappyLink::new(LinkConfig::default());
//! let result = link.connect().await;
//! if result.success {
//!     println!("daemon v{}", result.message);
//! }
//! link.dispose().await;
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod link;
pub mod locator;
pub mod supervisor;

pub use channel::{ChannelState, DaemonChannel};
pub use config::{DAEMON_HOST, DAEMON_PORT_FIRST, DAEMON_PORT_LAST, LinkConfig};
pub use link::{ConnectionReport, PhaseReport, SnappyLink};
pub use locator::DaemonAddress;
pub use supervisor::{LinkSupervisor, ServiceStatus};
