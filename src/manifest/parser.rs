//! YAML manifest parser

use crate::resources::{
    ListKind, ObjectMeta, Profile, ProfileSpec, ResourceKey, SharedList, SharedListSpec,
    DEFAULT_NAMESPACE,
};
use crate::{OperatorError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
struct ManifestMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

impl ManifestMeta {
    fn object_meta(&self) -> ObjectMeta {
        let namespace = self
            .namespace
            .clone()
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        ObjectMeta::new(namespace, self.name.trim())
    }
}

/// One YAML document, dispatched on `kind`; `apiVersion` and unknown fields are ignored
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
enum RawDocument {
    Profile {
        metadata: ManifestMeta,
        spec: ProfileSpec,
    },
    Allowlist {
        metadata: ManifestMeta,
        #[serde(default)]
        spec: SharedListSpec,
    },
    Denylist {
        metadata: ManifestMeta,
        #[serde(default)]
        spec: SharedListSpec,
    },
    TldList {
        metadata: ManifestMeta,
        #[serde(default)]
        spec: SharedListSpec,
    },
    Secret {
        metadata: ManifestMeta,
        #[serde(default, rename = "stringData", alias = "data")]
        string_data: BTreeMap<String, String>,
    },
}

/// Resolve `$NAME` values from the environment
fn resolve_value(source: &str, key: &ResourceKey, field: &str, value: &str) -> Result<String> {
    match value.strip_prefix('$') {
        Some(var) if !var.is_empty() => std::env::var(var).map_err(|_| {
            OperatorError::manifest(
                source,
                format!(
                    "secret {} key '{}' references unset environment variable {}",
                    key, field, var
                ),
            )
        }),
        _ => Ok(value.to_string()),
    }
}

/// Every object declared by a set of manifest files
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    pub profiles: Vec<Profile>,
    pub lists: Vec<SharedList>,
    pub secrets: Vec<(ResourceKey, BTreeMap<String, String>)>,
}

impl ManifestSet {
    /// Parse a multi-document YAML string; `source` names it in errors
    pub fn parse_str(content: &str, source: &str) -> Result<Self> {
        let mut set = Self::default();

        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| OperatorError::manifest(source, e.to_string()))?;
            if value.is_null() {
                continue;
            }
            let raw: RawDocument = serde_yaml::from_value(value)
                .map_err(|e| OperatorError::manifest(source, e.to_string()))?;

            match raw {
                RawDocument::Profile { metadata, spec } => {
                    set.profiles.push(Profile::new(metadata.object_meta(), spec));
                }
                RawDocument::Allowlist { metadata, spec } => {
                    set.lists
                        .push(SharedList::new(ListKind::Allowlist, metadata.object_meta(), spec));
                }
                RawDocument::Denylist { metadata, spec } => {
                    set.lists
                        .push(SharedList::new(ListKind::Denylist, metadata.object_meta(), spec));
                }
                RawDocument::TldList { metadata, spec } => {
                    set.lists
                        .push(SharedList::new(ListKind::TldList, metadata.object_meta(), spec));
                }
                RawDocument::Secret {
                    metadata,
                    string_data,
                } => {
                    let key = metadata.object_meta().key();
                    let data = string_data
                        .iter()
                        .map(|(field, value)| {
                            Ok((field.clone(), resolve_value(source, &key, field, value)?))
                        })
                        .collect::<Result<BTreeMap<_, _>>>()?;
                    set.secrets.push((key, data));
                }
            }
        }

        Ok(set)
    }

    /// Load one manifest file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content, &path.display().to_string())
    }

    /// Load every `*.yaml` and `*.yml` file under `dir`, recursively, in path order
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(OperatorError::manifest(
                dir.display(),
                "manifest directory does not exist",
            ));
        }

        let mut paths = Vec::new();
        for extension in ["yaml", "yml"] {
            let pattern = format!("{}/**/*.{}", dir.display(), extension);
            for entry in glob::glob(&pattern)? {
                paths.push(entry?);
            }
        }
        paths.sort();

        let mut set = Self::default();
        for path in &paths {
            tracing::debug!(path = %path.display(), "Loading manifest");
            set.extend(Self::load_file(path)?);
        }
        set.check_duplicates(&dir.display().to_string())?;

        tracing::debug!(
            files = paths.len(),
            profiles = set.profiles.len(),
            lists = set.lists.len(),
            secrets = set.secrets.len(),
            "Manifests loaded"
        );
        Ok(set)
    }

    pub fn extend(&mut self, other: ManifestSet) {
        self.profiles.extend(other.profiles);
        self.lists.extend(other.lists);
        self.secrets.extend(other.secrets);
    }

    /// Reject two declarations of the same object
    pub fn check_duplicates(&self, source: &str) -> Result<()> {
        let mut profiles = HashSet::new();
        for profile in &self.profiles {
            let key = profile.metadata.key();
            if !profiles.insert(key.clone()) {
                return Err(OperatorError::manifest(source, format!("duplicate Profile {}", key)));
            }
        }
        let mut lists = HashSet::new();
        for list in &self.lists {
            let key = list.metadata.key();
            if !lists.insert((list.kind, key.clone())) {
                return Err(OperatorError::manifest(
                    source,
                    format!("duplicate {} {}", list.kind, key),
                ));
            }
        }
        let mut secrets = HashSet::new();
        for (key, _) in &self.secrets {
            if !secrets.insert(key.clone()) {
                return Err(OperatorError::manifest(source, format!("duplicate Secret {}", key)));
            }
        }
        Ok(())
    }

    pub fn profile(&self, key: &ResourceKey) -> Option<&Profile> {
        self.profiles.iter().find(|p| &p.metadata.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: nextdns.io/v1alpha1
kind: Profile
metadata:
  name: kids
  namespace: home
spec:
  name: Kids
  credentialsRef:
    name: nextdns-credentials
  denylistRefs:
    - name: social
---
kind: Denylist
metadata:
  name: social
  namespace: home
spec:
  description: Social media
  entries:
    - domain: tiktok.com
    - domain: instagram.com
      active: false
      reason: allowed for now
---
kind: TldList
metadata:
  name: risky
spec:
  entries:
    - tld: zip
---
kind: Secret
metadata:
  name: nextdns-credentials
  namespace: home
stringData:
  apiKey: abc123
"#;

    #[test]
    fn test_parse_multi_document() {
        let set = ManifestSet::parse_str(MANIFEST, "test.yaml").unwrap();

        assert_eq!(set.profiles.len(), 1);
        let profile = &set.profiles[0];
        assert_eq!(profile.metadata.key(), ResourceKey::new("home", "kids"));
        assert_eq!(profile.spec.denylist_refs[0].name, "social");

        assert_eq!(set.lists.len(), 2);
        assert_eq!(set.lists[0].kind, ListKind::Denylist);
        assert!(!set.lists[0].spec.entries[1].active);
        assert_eq!(set.lists[1].kind, ListKind::TldList);
        assert_eq!(set.lists[1].metadata.namespace, DEFAULT_NAMESPACE);

        let (key, data) = &set.secrets[0];
        assert_eq!(key, &ResourceKey::new("home", "nextdns-credentials"));
        assert_eq!(data["apiKey"], "abc123");
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let err = ManifestSet::parse_str("kind: Rewrite\nmetadata:\n  name: x\n", "bad.yaml").unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        let set = ManifestSet::parse_str("---\n---\n", "empty.yaml").unwrap();
        assert!(set.profiles.is_empty());
    }

    #[test]
    fn test_secret_from_environment() {
        std::env::set_var("NEXTDNS_OPERATOR_TEST_KEY", "from-env");
        let yaml = "kind: Secret\nmetadata:\n  name: creds\nstringData:\n  apiKey: $NEXTDNS_OPERATOR_TEST_KEY\n";
        let set = ManifestSet::parse_str(yaml, "secret.yaml").unwrap();
        assert_eq!(set.secrets[0].1["apiKey"], "from-env");

        let yaml = "kind: Secret\nmetadata:\n  name: creds\nstringData:\n  apiKey: $NEXTDNS_OPERATOR_UNSET_KEY\n";
        assert!(ManifestSet::parse_str(yaml, "secret.yaml").is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut set = ManifestSet::parse_str(MANIFEST, "a.yaml").unwrap();
        set.extend(ManifestSet::parse_str(MANIFEST, "b.yaml").unwrap());
        assert!(set.check_duplicates("dir").is_err());
    }
}
