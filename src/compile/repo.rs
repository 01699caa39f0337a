//! Cache of compiled packages keyed by package identity and dependency key.

use relinst_index::{Index, IndexResult};
use serde::{Deserialize, Serialize};

use crate::release::Package;

/// Where a compiled package lives in the blobstore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPackageRecord {
    pub blob_id: String,
    pub blob_sha1: String,
    /// Key of the compiled dependencies this blob was built against
    pub dependency_key: String,
}

#[derive(Serialize)]
struct RecordKey<'a> {
    name: &'a str,
    fingerprint: &'a str,
    dependency_key: &'a str,
}

/// Compiled-package records persisted through an [`Index`].
pub struct CompiledPackageRepo<I: Index> {
    index: I,
}

impl<I: Index> CompiledPackageRepo<I> {
    pub fn new(index: I) -> Self {
        Self { index }
    }

    /// Look up a record for `package` built against `dependency_key`.
    pub fn find(
        &self,
        package: &Package,
        dependency_key: &str,
    ) -> IndexResult<Option<CompiledPackageRecord>> {
        self.index.find(&RecordKey {
            name: &package.name,
            fingerprint: &package.fingerprint,
            dependency_key,
        })
    }

    /// Persist a record. Saving the same record twice is a no-op.
    pub fn save(&mut self, package: &Package, record: &CompiledPackageRecord) -> IndexResult<()> {
        let key = RecordKey {
            name: &package.name,
            fingerprint: &package.fingerprint,
            dependency_key: &record.dependency_key,
        };
        self.index.save(&key, record)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
