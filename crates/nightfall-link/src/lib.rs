//! Telemetry Link Manager for the Nightfall rover console.
//!
//! The sans-I/O pieces ([`ConnectionSupervisor`], [`TelemetryReconciler`],
//! [`RateSampler`], [`CommandDispatcher`], [`OptimisticOverlay`]) hold all of
//! the state and are driven by [`TelemetryLink`], a single tokio task that owns
//! the websocket and publishes an immutable [`LinkView`] after every mutation.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod link;
pub mod overlay;
pub mod reconciler;
pub mod stats;
pub mod supervisor;

pub use backoff::ReconnectPolicy;
pub use config::{parse_endpoint, ConfigError, LinkConfig, DEFAULT_ENDPOINT};
pub use dispatcher::{CommandDispatcher, DispatchError, DispatchStats};
pub use link::{LinkCommander, LinkEvent, LinkHandle, LinkView, TelemetryLink};
pub use overlay::OptimisticOverlay;
pub use reconciler::TelemetryReconciler;
pub use stats::{ConnectionStats, RateSampler};
pub use supervisor::{ConnectionSupervisor, Directive, LinkErrorCode, LinkStatus};
