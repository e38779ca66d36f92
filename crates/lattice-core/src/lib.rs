//! Distributed task execution core.
//!
//! Accepts opaque `(input, function-identifier)` work, places it on
//! cluster members, supervises execution, retries failures with bounded
//! exponential backoff, checkpoints in-flight state, and delivers each
//! outcome to its caller exactly once.
//!
//! The long-lived pieces, leaves first:
//!
//! - [`lattice_store::CheckpointStore`] -- last-known snapshot per task.
//! - [`discovery::Discovery`] -- membership, heartbeats, pruning.
//! - [`supervisor::Supervisor`] -- owns the workers on one node.
//! - [`recovery::Recovery`] -- retry policy over lifecycle events.
//! - [`distributor::Distributor`] -- the caller-facing front door.
//! - [`processor::PatternProcessor`] -- split/aggregate adapter on top.
//!
//! [`cluster::ClusterNode`] wires them together for one member;
//! [`transport::Transport`] carries the inter-node surface.

pub mod cluster;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod error;
pub mod node_id;
pub mod placement;
pub mod processor;
pub mod recovery;
pub mod registry;
pub mod snapshot;
pub mod supervision;
pub mod supervisor;
pub mod task;
pub mod transport;
