//! The agent-pm coordinator.
//!
//! A single long-running process that polls the task-management server for
//! work, spawns one AI CLI child per `(agent, project)` pair, supervises the
//! children, damps restart loops after failures, and streams completed
//! execution logs back out.

pub mod cooldown;
pub mod coordinator;
pub mod lock;
pub mod quota;
pub mod registry;
pub mod spawn;
pub mod uploader;

pub use coordinator::Coordinator;
pub use lock::{CoordinatorLock, LockError};
pub use registry::InstanceKey;
