//! Zone Audio Client Library
//!
//! Streams location-driven ambient-audio directives for players of a tick-driven
//! world to a remote audio-coordination service over a WebSocket connection.
//!
//! # Layout
//!
//! - [`net`] - reconnecting duplex client, wire protocol, inbound dispatch
//! - [`scheduler`] - per-player periodic work spread across displaced tick buckets
//! - [`audio`] - rule model, audio registry and the resolution engine
//! - [`regions`] - spatial query collaborator and in-memory region backends
//! - [`host`] - tick loop and world collaborators
//!
//! # Features
//!
//! - `metrics_http` - serve metrics over HTTP from the runner binary (enabled by default)

pub mod audio;
pub mod config;
pub mod host;
pub mod metrics;
pub mod net;
pub mod regions;
pub mod scheduler;

pub use audio::tracker::AudioTracker;
pub use config::ClientConfig;
pub use net::client::AudioClient;
pub use scheduler::PlayerScheduler;

/// Identifier of a player, shared with the remote service.
pub type EntityId = uuid::Uuid;
