//! Job template rendering.
//!
//! Templates are rendered with the installation properties and the rendered
//! job is moved into place as a blob so that a job directory is always
//! replaced by a complete, verified tree.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use regex_lite::{Captures, Regex};
use relinst_blobstore::{Blobstore, BlobstoreError};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::remove_dir_if_exists;
use crate::archive::{self, ArchiveError};
use crate::extract::{BlobExtractor, ExtractError};
use crate::release::Job;

/// Errors from rendering one template.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("property '{0}' is not set and has no default")]
    MissingProperty(String),

    #[error("invalid template pattern: {0}")]
    Pattern(#[from] regex_lite::Error),
}

/// Errors from rendering and installing a job.
#[derive(Debug, Error)]
pub enum JobRenderError {
    #[error("job '{job}': template '{template}': {source}")]
    Template {
        job: String,
        template: String,
        #[source]
        source: RenderError,
    },

    #[error("job '{job}': reading template '{template}': {source}")]
    ReadTemplate {
        job: String,
        template: String,
        #[source]
        source: io::Error,
    },

    #[error("job '{job}': template destination '{path}' leaves the job directory")]
    UnsafeDestination { job: String, path: String },

    #[error("job '{job}': template '{path}' is outside the templates directory")]
    UnsafeTemplate { job: String, path: String },

    #[error("walking job directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("packing rendered job: {0}")]
    Archive(#[from] ArchiveError),

    #[error("storing rendered job: {0}")]
    Store(#[from] BlobstoreError),

    #[error("extracting rendered job: {0}")]
    Extract(#[from] ExtractError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Renders template text with a property tree.
pub trait Renderer {
    fn render(&self, template: &str, properties: &Map<String, Value>) -> Result<String, RenderError>;
}

/// Substitutes `<%= p("dotted.key") %>` and `<%= p("dotted.key", default) %>`.
///
/// Defaults may be a double-quoted string or a bare literal (`42`, `true`,
/// `nil`). Any other template text is copied through unchanged.
pub struct PropertyRenderer {
    pattern: Regex,
}

impl PropertyRenderer {
    pub fn new() -> Result<Self, RenderError> {
        let pattern = Regex::new(
            r#"<%=\s*p\(\s*"([^"]+)"\s*(?:,\s*(?:"([^"]*)"|([\w.+-]+)))?\s*\)\s*%>"#,
        )?;
        Ok(Self { pattern })
    }
}

impl Renderer for PropertyRenderer {
    fn render(&self, template: &str, properties: &Map<String, Value>) -> Result<String, RenderError> {
        let mut missing = None;

        let rendered = self.pattern.replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            if let Some(value) = lookup(properties, key) {
                return format_value(value);
            }
            if let Some(default) = caps.get(2) {
                return default.as_str().to_string();
            }
            if let Some(default) = caps.get(3) {
                return match default.as_str() {
                    "nil" => String::new(),
                    literal => literal.to_string(),
                };
            }
            missing.get_or_insert_with(|| key.to_string());
            String::new()
        });

        match missing {
            Some(key) => Err(RenderError::MissingProperty(key)),
            None => Ok(rendered.into_owned()),
        }
    }
}

/// Resolve a dotted key against nested tables. A literal key containing
/// dots takes precedence over the nested path.
fn lookup<'a>(properties: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = properties.get(key) {
        return Some(value);
    }

    let mut segments = key.split('.');
    let mut current = properties.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A job installed into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedJob {
    pub name: String,
    pub path: PathBuf,
    /// SHA-1 of the rendered job archive
    pub sha1: String,
}

/// Renders jobs and moves them into place through the blobstore.
pub struct JobRenderer<'r> {
    renderer: &'r dyn Renderer,
    blobstore: Arc<dyn Blobstore>,
    extractor: BlobExtractor,
    scratch_root: PathBuf,
}

impl<'r> JobRenderer<'r> {
    pub fn new(
        renderer: &'r dyn Renderer,
        blobstore: Arc<dyn Blobstore>,
        extractor: BlobExtractor,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            renderer,
            blobstore,
            extractor,
            scratch_root,
        }
    }

    /// Render `job` and replace `dest` with the result.
    ///
    /// Files in the job directory other than `templates/` are copied as is;
    /// each template is written to its destination path.
    pub fn render(
        &self,
        job: &Job,
        properties: &Map<String, Value>,
        dest: &Path,
    ) -> Result<RenderedJob, JobRenderError> {
        fs::create_dir_all(&self.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("render-{}-", job.name))
            .tempdir_in(&self.scratch_root)?;
        let staging = scratch.path().join("job");
        fs::create_dir_all(&staging)?;

        if job.dir.is_dir() {
            copy_job_files(&job.dir, &staging)?;
        }

        let templates_dir = job.templates_dir();
        for (template, destination) in &job.templates {
            let template_path = safe_relative(template).ok_or_else(|| {
                JobRenderError::UnsafeTemplate {
                    job: job.name.clone(),
                    path: template.clone(),
                }
            })?;
            let relative = safe_relative(destination).ok_or_else(|| {
                JobRenderError::UnsafeDestination {
                    job: job.name.clone(),
                    path: destination.clone(),
                }
            })?;

            let source = fs::read_to_string(templates_dir.join(template_path)).map_err(|source| {
                JobRenderError::ReadTemplate {
                    job: job.name.clone(),
                    template: template.clone(),
                    source,
                }
            })?;
            let rendered = self.renderer.render(&source, properties).map_err(|source| {
                JobRenderError::Template {
                    job: job.name.clone(),
                    template: template.clone(),
                    source,
                }
            })?;

            let out = staging.join(relative);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&out, rendered)?;
            debug!(job = %job.name, template = %template, dest = %destination, "rendered template");
        }

        let archive_path = scratch.path().join("job.tgz");
        archive::pack_dir(&staging, &archive_path)?;
        let blob = self.blobstore.create(&archive_path)?;

        let installed = remove_dir_if_exists(dest).map_err(JobRenderError::from).and_then(|()| {
            self.extractor
                .extract(&blob.id, &blob.sha1, dest)
                .map_err(JobRenderError::from)
        });
        let deleted = self.extractor.cleanup(&blob.id);
        installed?;
        deleted?;
        scratch.close()?;

        info!(job = %job.name, path = %dest.display(), "job rendered");
        Ok(RenderedJob {
            name: job.name.clone(),
            path: dest.to_path_buf(),
            sha1: blob.sha1,
        })
    }
}

fn copy_job_files(job_dir: &Path, staging: &Path) -> Result<(), JobRenderError> {
    let templates_dir = job_dir.join("templates");

    for entry in WalkDir::new(job_dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if path.starts_with(&templates_dir) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(job_dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let out = staging.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&out)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(path)?, &out)?;
        } else {
            fs::copy(path, &out)?;
        }
    }
    Ok(())
}

/// `path` as a relative path that stays inside its base, if it is one.
fn safe_relative(path: &str) -> Option<&Path> {
    let path = Path::new(path);
    let normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    (normal && !path.as_os_str().is_empty()).then_some(path)
}
