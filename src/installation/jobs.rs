//! Selecting the jobs of a release to install.

use thiserror::Error;

use crate::release::{Job, Release};

#[derive(Debug, Error)]
pub enum JobResolveError {
    #[error("job '{job}' is not part of release '{release}'")]
    UnknownJob { job: String, release: String },
}

/// Resolves job names against a release.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobResolver;

impl JobResolver {
    pub fn new() -> Self {
        Self
    }

    /// Jobs named in `names`, in that order. No names selects every job in
    /// release order.
    pub fn resolve<'r>(
        &self,
        release: &'r Release,
        names: &[String],
    ) -> Result<Vec<&'r Job>, JobResolveError> {
        if names.is_empty() {
            return Ok(release.jobs().iter().collect());
        }

        names
            .iter()
            .map(|name| {
                release.job(name).ok_or_else(|| JobResolveError::UnknownJob {
                    job: name.clone(),
                    release: release.name().to_string(),
                })
            })
            .collect()
    }
}
