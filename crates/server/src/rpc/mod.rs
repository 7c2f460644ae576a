//! Consumer-facing RPC over a Unix socket
//!
//! Exposes the session commands to a separate process. Each message is a
//! versioned postcard frame; a successful open attaches the duplicated
//! descriptor to its response as `SCM_RIGHTS` ancillary data.
//!
//! # Architecture
//!
//! ```text
//! BridgeServer
//!   ├─> bind socket (replace stale file)
//!   └─> spawn ConsumerConnection per consumer
//!         ├─> reader task: frames -> request queue
//!         ├─> route requests to SessionManager
//!         ├─> forward hotplug events while subscribed
//!         └─> cancel subscription on disconnect
//! ```

pub mod connection;
pub mod server;

pub use connection::ConsumerConnection;
pub use server::BridgeServer;
