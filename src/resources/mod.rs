//! Declared resources
//!
//! Data structures for the objects the controller reconciles:
//!
//! - **Profile**: the primary resource, one remote policy profile
//! - **SharedList**: reusable allowlists, denylists and TLD lists
//! - **Condition**: typed status observations
//! - **validation**: spec checks run before any remote call

mod condition;
mod ids;
mod list;
mod meta;
mod profile;
pub mod validation;

pub use condition::{
    find_condition, set_condition, Condition, ConditionStatus, READY, REFERENCES_RESOLVED, SYNCED,
};
pub use ids::{ParseKeyError, ResourceKey, ResourceRef, DEFAULT_NAMESPACE};
pub use list::{
    ListEntry, ListKind, ProfileReference, SharedList, SharedListSpec, SharedListStatus,
};
pub use meta::{ObjectMeta, PROFILE_FINALIZER};
pub use profile::{
    BlockPageSpec, Collection, CollectionStatus, DeletionPolicy, LogsSpec, ParentalControlSpec,
    PerformanceSpec, Phase, PrivacySpec, Profile, ProfileSpec, ProfileStatus, ReferenceStatus,
    SecretKeyRef, SecuritySpec, SettingsSpec, SyncCounts,
};
pub use validation::{validate_list, validate_profile, FieldError};
