//! vmhost - per-host agent for short-lived runner VMs.
//!
//! The agent keeps a bounded LRU cache of base images fetched from an object
//! store, admits at most a fixed number of concurrent VMs, and provisions
//! each VM through a staged pipeline that rolls back on failure.
//!
//! # Example
//!
//! ```bash
//! vmhost serve --config /etc/vmhost/agent.toml
//!
//! curl -X POST http://localhost:8081/provision-vm \
//!   -H "Content-Type: application/json" \
//!   -d '{"vmId": "vm-1", "imageName": "sonoma-14.5.img"}'
//! ```

pub mod admission;
pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod deprovision;
pub mod driver;
pub mod error;
pub mod heartbeat;
pub mod machine_id;
pub mod process;
pub mod provision;
pub mod registry;
pub mod remote;
pub mod store;
pub mod util;

pub use agent::{Agent, Collaborators};
pub use error::{Error, Result};

/// Agent version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
