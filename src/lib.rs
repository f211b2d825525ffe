//! nextdns-operator - Declarative reconciliation of NextDNS profiles
//!
//! Profiles and reusable allowlists, denylists and TLD lists are declared as
//! YAML manifests. A controller continuously converges each remote profile
//! onto its declared state with the fewest remote calls, and re-runs every
//! dependent profile when a shared list or credentials secret changes.
//!
//! # Architecture
//!
//! - **resources**: Declared objects (Profile, SharedList) and their status
//! - **store**: Resource store trait, in-memory store and state file
//! - **api**: Remote policy API trait, REST client and recording fake
//! - **reconcile**: Resolver, differencer, sync executor and state machine
//! - **controller**: Work queue, event dispatch and worker pool
//! - **manifest**: YAML manifest loading and the polling manifest source
//! - **config**: Operator configuration file and validation
//! - **server**: Health, metrics and status endpoint

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod resources;
pub mod retry;

// Components
pub mod api;
pub mod controller;
pub mod manifest;
pub mod metrics;
pub mod reconcile;
pub mod server;
pub mod store;

// Re-exports
pub use error::{OperatorError, Result};
