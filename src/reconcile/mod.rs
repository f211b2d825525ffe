//! Reconciliation engine
//!
//! One reconcile is a pure re-derivation from current inputs:
//!
//! - **resolver**: references plus inline entries into one merged document
//! - **desired**: merged document plus feature toggles into per-collection desired state
//! - **diff**: desired vs remote into the minimal operation list
//! - **executor**: operations against the policy API, one collection at a time
//! - **status**: per-call outcomes into conditions and counts
//! - **machine**: the state machine driving all of the above per key
//! - **dependents**: which profiles to re-run when a shared list or secret changes

pub mod dependents;
pub mod desired;
pub mod diff;
mod error;
pub mod executor;
pub mod machine;
pub mod resolver;
pub mod status;

pub use dependents::{find_dependents, DependencyTarget, DependentIndex};
pub use desired::DesiredState;
pub use diff::{diff, DesiredEntry, DiffMode, Operation};
pub use error::{Action, ErrorClass, ReconcileError};
pub use executor::{CollectionOutcome, SyncExecutor, SyncReport};
pub use machine::{ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use resolver::{
    EntrySource, MergedDocument, MergedEntry, ReferenceNotFoundError, Resolution, ResolveError,
    ResolvedReference, Resolver,
};

use crate::resources::{ListKind, ResourceKey};
use std::fmt;

/// Unit of work for the controller queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReconcileKey {
    Profile(ResourceKey),
    List(ListKind, ResourceKey),
}

impl ReconcileKey {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileKey::Profile(_) => "Profile",
            ReconcileKey::List(kind, _) => kind.as_str(),
        }
    }

    pub fn resource(&self) -> &ResourceKey {
        match self {
            ReconcileKey::Profile(key) | ReconcileKey::List(_, key) => key,
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.resource())
    }
}
