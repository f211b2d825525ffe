//! Declarative manifests
//!
//! Profiles, shared lists and secrets are declared as Kubernetes-style YAML
//! documents (`kind`, `metadata`, `spec`). Several documents may share one
//! file, separated by `---`:
//!
//! ```yaml
//! kind: Profile
//! metadata:
//!   name: kids
//!   namespace: home
//! spec:
//!   name: Kids
//!   credentialsRef:
//!     name: nextdns-credentials
//!   denylistRefs:
//!     - name: social
//! ---
//! kind: Secret
//! metadata:
//!   name: nextdns-credentials
//!   namespace: home
//! stringData:
//!   apiKey: $NEXTDNS_API_KEY
//! ```

mod parser;
mod source;

pub use parser::ManifestSet;
pub use source::{ManifestSource, ManifestSyncReport};
