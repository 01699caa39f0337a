//! `release.toml` parsing.
//!
//! ```toml
//! name = "cpi"
//! version = "1.0"
//!
//! [[package]]
//! name = "ruby"
//! sha1 = "..."                       # SHA-1 of the source archive
//! archive = "packages/ruby.tgz"      # default: packages/<name>.tgz
//! dependencies = ["libyaml"]
//! fingerprint = "..."                # optional, computed when absent
//!
//! [[job]]
//! name = "cpi"
//! packages = ["ruby"]
//! templates = { "cpi.json.erb" = "config/cpi.json" }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{package_fingerprint, Job, Package, Release, ReleaseError, SourceArchive};

/// File name of the release manifest inside a release directory.
pub const RELEASE_MANIFEST: &str = "release.toml";

/// Parsed `release.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub name: String,
    pub version: String,

    #[serde(default, rename = "package")]
    pub packages: Vec<PackageEntry>,

    #[serde(default, rename = "job")]
    pub jobs: Vec<JobEntry>,
}

/// A `[[package]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,

    /// SHA-1 of the source archive
    pub sha1: String,

    /// Archive path relative to the release directory
    #[serde(default)]
    pub archive: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// A `[[job]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub name: String,

    #[serde(default)]
    pub packages: Vec<String>,

    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

impl ReleaseManifest {
    /// Load `release.toml` from a release directory
    pub fn load(dir: &Path) -> Result<Self, ReleaseError> {
        let path = dir.join(RELEASE_MANIFEST);
        if !path.exists() {
            return Err(ReleaseError::NotFound(path));
        }

        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    /// Parse a release manifest from TOML string
    pub fn parse(content: &str) -> Result<Self, ReleaseError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve paths against `dir` and fill in missing fingerprints.
    pub fn into_release(self, dir: &Path) -> Result<Release, ReleaseError> {
        let fingerprints = self.resolve_fingerprints()?;

        let mut packages = Vec::with_capacity(self.packages.len());
        for entry in self.packages {
            let fingerprint = fingerprints.get(&entry.name).cloned().ok_or_else(|| {
                ReleaseError::Fingerprint {
                    package: entry.name.clone(),
                    reason: "not resolved".to_string(),
                }
            })?;
            let archive = entry
                .archive
                .unwrap_or_else(|| format!("packages/{}.tgz", entry.name));

            packages.push(Package {
                fingerprint,
                source: SourceArchive {
                    path: dir.join(archive),
                    sha1: entry.sha1,
                },
                dependencies: entry.dependencies,
                name: entry.name,
            });
        }

        let jobs = self
            .jobs
            .into_iter()
            .map(|entry| Job {
                dir: dir.join("jobs").join(&entry.name),
                name: entry.name,
                packages: entry.packages,
                templates: entry.templates,
            })
            .collect();

        Release::new(self.name, self.version, packages, jobs)
    }

    /// Fingerprint of every package, computing the ones not given.
    fn resolve_fingerprints(&self) -> Result<HashMap<String, String>, ReleaseError> {
        let mut entries: HashMap<&str, &PackageEntry> = HashMap::new();
        for entry in &self.packages {
            if entries.insert(entry.name.as_str(), entry).is_some() {
                return Err(ReleaseError::DuplicateName {
                    kind: "package",
                    name: entry.name.clone(),
                });
            }
        }

        let mut resolved = HashMap::new();
        for entry in &self.packages {
            let mut visiting = Vec::new();
            fingerprint_of(&entry.name, &entries, &mut resolved, &mut visiting)?;
        }
        Ok(resolved)
    }
}

fn fingerprint_of<'m>(
    name: &'m str,
    entries: &HashMap<&'m str, &'m PackageEntry>,
    resolved: &mut HashMap<String, String>,
    visiting: &mut Vec<&'m str>,
) -> Result<String, ReleaseError> {
    if let Some(fingerprint) = resolved.get(name) {
        return Ok(fingerprint.clone());
    }

    let entry: &'m PackageEntry = entries.get(name).copied().ok_or_else(|| {
        ReleaseError::Fingerprint {
            package: name.to_string(),
            reason: "unknown package".to_string(),
        }
    })?;

    if let Some(fingerprint) = &entry.fingerprint {
        resolved.insert(name.to_string(), fingerprint.clone());
        return Ok(fingerprint.clone());
    }

    if let Some(start) = visiting.iter().position(|n| *n == name) {
        let mut packages: Vec<String> = visiting[start..].iter().map(|n| n.to_string()).collect();
        packages.sort();
        return Err(ReleaseError::Cycle { packages });
    }

    visiting.push(name);
    let mut dependencies = Vec::with_capacity(entry.dependencies.len());
    for dependency in &entry.dependencies {
        if !entries.contains_key(dependency.as_str()) {
            return Err(ReleaseError::UnknownDependency {
                package: name.to_string(),
                dependency: dependency.clone(),
            });
        }
        let fingerprint = fingerprint_of(dependency, entries, resolved, visiting)?;
        dependencies.push((dependency.as_str(), fingerprint));
    }
    visiting.pop();

    let pairs: Vec<(&str, &str)> = dependencies
        .iter()
        .map(|(dep, fingerprint)| (*dep, fingerprint.as_str()))
        .collect();
    let fingerprint = package_fingerprint(name, &entry.sha1, &pairs).map_err(|e| {
        ReleaseError::Fingerprint {
            package: name.to_string(),
            reason: e.to_string(),
        }
    })?;

    resolved.insert(name.to_string(), fingerprint.clone());
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"
name = "cpi"
version = "1.0"

[[package]]
name = "libyaml"
sha1 = "aaa"

[[package]]
name = "ruby"
sha1 = "bbb"
archive = "blobs/ruby-2.7.tgz"
dependencies = ["libyaml"]

[[job]]
name = "cpi"
packages = ["ruby"]
templates = { "cpi.json.erb" = "config/cpi.json" }
"#;

    #[test]
    fn test_parse_and_resolve() {
        let release = ReleaseManifest::parse(SAMPLE)
            .unwrap()
            .into_release(Path::new("/releases/cpi"))
            .unwrap();

        let libyaml = release.package("libyaml").unwrap();
        assert_eq!(
            libyaml.source.path,
            PathBuf::from("/releases/cpi/packages/libyaml.tgz")
        );
        assert_eq!(libyaml.fingerprint.len(), 64);

        let ruby = release.package("ruby").unwrap();
        assert_eq!(
            ruby.source.path,
            PathBuf::from("/releases/cpi/blobs/ruby-2.7.tgz")
        );
        assert_eq!(ruby.dependencies, vec!["libyaml"]);

        let job = release.job("cpi").unwrap();
        assert_eq!(job.dir, PathBuf::from("/releases/cpi/jobs/cpi"));
        assert_eq!(job.templates["cpi.json.erb"], "config/cpi.json");
    }

    #[test]
    fn test_dependency_source_change_changes_dependent_fingerprint() {
        let before = ReleaseManifest::parse(SAMPLE)
            .unwrap()
            .into_release(Path::new("/r"))
            .unwrap();
        let after = ReleaseManifest::parse(&SAMPLE.replace("sha1 = \"aaa\"", "sha1 = \"ccc\""))
            .unwrap()
            .into_release(Path::new("/r"))
            .unwrap();

        assert_ne!(
            before.package("libyaml").unwrap().fingerprint,
            after.package("libyaml").unwrap().fingerprint
        );
        assert_ne!(
            before.package("ruby").unwrap().fingerprint,
            after.package("ruby").unwrap().fingerprint
        );
    }

    #[test]
    fn test_explicit_fingerprint_kept() {
        let manifest = r#"
name = "cpi"
version = "1.0"

[[package]]
name = "ruby"
sha1 = "bbb"
fingerprint = "ruby-fp"
"#;
        let release = ReleaseManifest::parse(manifest)
            .unwrap()
            .into_release(Path::new("/r"))
            .unwrap();
        assert_eq!(release.package("ruby").unwrap().fingerprint, "ruby-fp");
    }

    #[test]
    fn test_cycle_while_fingerprinting() {
        let manifest = r#"
name = "cpi"
version = "1.0"

[[package]]
name = "a"
sha1 = "1"
dependencies = ["b"]

[[package]]
name = "b"
sha1 = "2"
dependencies = ["a"]
"#;
        let result = ReleaseManifest::parse(manifest)
            .unwrap()
            .into_release(Path::new("/r"));
        match result {
            Err(ReleaseError::Cycle { packages }) => assert_eq!(packages, vec!["a", "b"]),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let manifest = r#"
name = "cpi"
version = "1.0"

[[package]]
name = "ruby"
sha1 = "1"
dependencies = ["libyaml"]
"#;
        let result = ReleaseManifest::parse(manifest)
            .unwrap()
            .into_release(Path::new("/r"));
        assert!(matches!(result, Err(ReleaseError::UnknownDependency { .. })));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReleaseManifest::load(dir.path());
        assert!(matches!(result, Err(ReleaseError::NotFound(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = ReleaseManifest::parse("name = ");
        assert!(matches!(result, Err(ReleaseError::Parse(_))));
    }
}
