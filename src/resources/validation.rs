//! Spec validation
//!
//! Catches malformed specs before any remote call is made. A profile that
//! fails validation is not retried until its spec changes.

use super::list::{ListEntry, ListKind, SharedList};
use super::profile::Profile;
use std::collections::HashSet;
use std::fmt;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// One invalid field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<FieldError>>;

/// Join field errors into one status message
pub fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a profile spec
pub fn validate_profile(profile: &Profile) -> ValidationResult {
    let spec = &profile.spec;
    let mut errors = Vec::new();

    if spec.name.trim().is_empty() {
        errors.push(FieldError::new("spec.name", "must not be empty"));
    }
    if spec.credentials_ref.name.trim().is_empty() {
        errors.push(FieldError::new("spec.credentialsRef.name", "must not be empty"));
    }
    if spec.credentials_ref.key.trim().is_empty() {
        errors.push(FieldError::new("spec.credentialsRef.key", "must not be empty"));
    }
    if let Some(ref id) = spec.profile_id {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            errors.push(FieldError::new(
                "spec.profileId",
                format!("'{}' is not a valid profile ID", id),
            ));
        }
    }

    for kind in ListKind::ALL {
        let mut seen = HashSet::new();
        for (i, reference) in spec.refs(kind).iter().enumerate() {
            let field = format!("spec.{}[{}]", kind.reference_field(), i);
            if reference.name.trim().is_empty() {
                errors.push(FieldError::new(field, "name must not be empty"));
                continue;
            }
            let key = reference.to_key(&profile.metadata.namespace);
            if !seen.insert(key.clone()) {
                errors.push(FieldError::new(field, format!("duplicate reference to {}", key)));
            }
        }
    }

    validate_entries(ListKind::Allowlist, "spec.allowlist", &spec.allowlist, &mut errors);
    validate_entries(ListKind::Denylist, "spec.denylist", &spec.denylist, &mut errors);
    if let Some(ref security) = spec.security {
        validate_entries(
            ListKind::TldList,
            "spec.security.blockedTlds",
            &security.blocked_tlds,
            &mut errors,
        );
    }

    if let Some(ref privacy) = spec.privacy {
        validate_ids("spec.privacy.blocklists", &privacy.blocklists, &mut errors);
        validate_ids("spec.privacy.natives", &privacy.natives, &mut errors);
    }
    if let Some(ref parental) = spec.parental_control {
        validate_ids("spec.parentalControl.services", &parental.services, &mut errors);
        validate_ids("spec.parentalControl.categories", &parental.categories, &mut errors);
    }
    if let Some(logs) = spec.settings.as_ref().and_then(|s| s.logs.as_ref()) {
        if let Some(ref location) = logs.location {
            if location.trim().is_empty() {
                errors.push(FieldError::new(
                    "spec.settings.logs.location",
                    "must not be empty when set",
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a shared list spec
pub fn validate_list(list: &SharedList) -> ValidationResult {
    let mut errors = Vec::new();
    validate_entries(list.kind, "spec.entries", &list.spec.entries, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_entries(kind: ListKind, field: &str, entries: &[ListEntry], errors: &mut Vec<FieldError>) {
    for (i, entry) in entries.iter().enumerate() {
        let result = match kind {
            ListKind::TldList => check_tld(&entry.value),
            _ => check_domain(&entry.value),
        };
        if let Err(message) = result {
            errors.push(FieldError::new(format!("{}[{}]", field, i), message));
        }
    }
}

fn validate_ids(field: &str, ids: &[String], errors: &mut Vec<FieldError>) {
    for (i, id) in ids.iter().enumerate() {
        if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
            errors.push(FieldError::new(
                format!("{}[{}]", field, i),
                format!("'{}' is not a valid ID", id),
            ));
        }
    }
}

/// Check that a value is a bare domain name
pub fn check_domain(value: &str) -> Result<(), String> {
    let normalized = ListKind::Denylist.normalize(value);
    if normalized.is_empty() {
        return Err("domain must not be empty".to_string());
    }
    if normalized.contains("://") || normalized.contains('/') {
        return Err(format!("'{}' must be a domain, not a URL", value));
    }
    if normalized.len() > MAX_DOMAIN_LEN {
        return Err(format!("'{}' is longer than {} characters", value, MAX_DOMAIN_LEN));
    }
    for label in normalized.split('.') {
        check_label(value, label)?;
    }
    Ok(())
}

/// Check that a value is a single top-level domain label
pub fn check_tld(value: &str) -> Result<(), String> {
    let normalized = ListKind::TldList.normalize(value);
    if normalized.is_empty() {
        return Err("TLD must not be empty".to_string());
    }
    if normalized.contains('.') {
        return Err(format!("'{}' must be a single label TLD", value));
    }
    check_label(value, &normalized)
}

fn check_label(value: &str, label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err(format!("'{}' contains an empty label", value));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!("'{}' has a label longer than {} characters", value, MAX_LABEL_LEN));
    }
    if !label
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!("'{}' contains invalid characters", value));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("'{}' has a label starting or ending with '-'", value));
    }
    Ok(())
}
