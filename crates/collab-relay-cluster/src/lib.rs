//! Cluster coordination layer for horizontally scaled collaboration gateways.
//!
//! A [`ClusterCoordinator`] keeps each gateway process registered in the
//! shared store and fans room, user, presence and instance-sync messages out
//! to its peers. A [`RateLimiter`] enforces per-user throughput and per-user
//! and per-IP connection quotas consistently across the same processes.

pub mod coordinator;
pub mod handler;
pub mod hot_reload;
pub mod maintenance;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod state;

pub use coordinator::{ClusterCoordinator, ClusterStats, CoordinatorSettings, InstanceState};
pub use handler::{ChannelEventHandler, ClusterEvent, ClusterEventHandler, TracingEventHandler};
pub use rate_limit::{ConnectionLimitResult, RateLimitResult, RateLimiter};
pub use server::start_admin_server;
pub use state::RelayState;
