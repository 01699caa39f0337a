//! Compiling every package a set of jobs needs, dependencies first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, info};

use super::package::{CompileError, CompiledPackageRef, PackageCompiler};
use crate::release::{Job, Package, Release};

/// Errors from compiling a job's package closure.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("package '{package}' required by '{required_by}' is not in the release")]
    UnknownPackage { package: String, required_by: String },

    #[error("dependency cycle between packages: {}", .packages.join(", "))]
    Cycle { packages: Vec<String> },

    #[error("failed to compile package '{package}': {source}")]
    Compile {
        package: String,
        #[source]
        source: CompileError,
    },
}

/// Packages compiled in one run, in dependency order.
#[derive(Debug, Clone, Default)]
pub struct CompiledPackages {
    refs: Vec<CompiledPackageRef>,
}

impl CompiledPackages {
    pub fn iter(&self) -> impl Iterator<Item = &CompiledPackageRef> {
        self.refs.iter()
    }

    pub fn get(&self, name: &str) -> Option<&CompiledPackageRef> {
        self.refs.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.refs.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

impl IntoIterator for CompiledPackages {
    type Item = CompiledPackageRef;
    type IntoIter = std::vec::IntoIter<CompiledPackageRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.refs.into_iter()
    }
}

/// Drives a [`PackageCompiler`] over the packages required by jobs.
pub struct DependencyCompiler<C: PackageCompiler> {
    compiler: C,
}

impl<C: PackageCompiler> DependencyCompiler<C> {
    pub fn new(compiler: C) -> Self {
        Self { compiler }
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn into_inner(self) -> C {
        self.compiler
    }

    /// Compile every package `jobs` need, each after all of its dependencies.
    ///
    /// Each fingerprint is compiled at most once per call. The first failure
    /// aborts the run; packages compiled before it stay cached.
    pub fn compile(
        &mut self,
        release: &Release,
        jobs: &[&Job],
    ) -> Result<CompiledPackages, DependencyError> {
        let required = required_packages(release, jobs)?;
        let order = compile_order(release, &required)?;

        info!(
            release = %release.name(),
            packages = order.len(),
            "compiling job dependencies"
        );

        let mut compiled = CompiledPackages::default();
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for package in order {
            if let Some(&index) = seen.get(package.fingerprint.as_str()) {
                let record = compiled.refs[index].record.clone();
                debug!(package = %package.name, "fingerprint already compiled in this run");
                compiled.refs.push(CompiledPackageRef {
                    name: package.name.clone(),
                    fingerprint: package.fingerprint.clone(),
                    record,
                });
                continue;
            }

            let mut dependencies = Vec::with_capacity(package.dependencies.len());
            for name in &package.dependencies {
                let dependency = compiled
                    .get(name)
                    .ok_or_else(|| DependencyError::UnknownPackage {
                        package: name.clone(),
                        required_by: package.name.clone(),
                    })?;
                dependencies.push(dependency.clone());
            }

            let record = self
                .compiler
                .compile(package, &dependencies)
                .map_err(|source| DependencyError::Compile {
                    package: package.name.clone(),
                    source,
                })?;

            seen.insert(package.fingerprint.as_str(), compiled.refs.len());
            compiled.refs.push(CompiledPackageRef {
                name: package.name.clone(),
                fingerprint: package.fingerprint.clone(),
                record,
            });
        }

        Ok(compiled)
    }
}

/// Names of every package `jobs` need, directly or transitively.
fn required_packages<'r>(
    release: &'r Release,
    jobs: &[&'r Job],
) -> Result<BTreeSet<&'r str>, DependencyError> {
    let mut required = BTreeSet::new();
    let mut pending: Vec<(&'r str, &'r str)> = Vec::new();

    for &job in jobs {
        for name in &job.packages {
            pending.push((name.as_str(), job.name.as_str()));
        }
    }

    while let Some((name, required_by)) = pending.pop() {
        if required.contains(name) {
            continue;
        }
        let package = release
            .package(name)
            .ok_or_else(|| DependencyError::UnknownPackage {
                package: name.to_string(),
                required_by: required_by.to_string(),
            })?;
        required.insert(package.name.as_str());
        for dependency in &package.dependencies {
            pending.push((dependency.as_str(), package.name.as_str()));
        }
    }

    Ok(required)
}

/// Topological order of `required`, dependencies before dependents.
fn compile_order<'r>(
    release: &'r Release,
    required: &BTreeSet<&'r str>,
) -> Result<Vec<&'r Package>, DependencyError> {
    let mut graph: DiGraph<&'r Package, ()> = DiGraph::new();
    let mut nodes: BTreeMap<&str, NodeIndex> = BTreeMap::new();

    for name in required {
        let package = release
            .package(name)
            .ok_or_else(|| DependencyError::UnknownPackage {
                package: name.to_string(),
                required_by: release.name().to_string(),
            })?;
        nodes.insert(*name, graph.add_node(package));
    }

    for (name, &node) in &nodes {
        let package = graph[node];
        for dependency in &package.dependencies {
            let dep_node = nodes.get(dependency.as_str()).copied().ok_or_else(|| {
                DependencyError::UnknownPackage {
                    package: dependency.clone(),
                    required_by: name.to_string(),
                }
            })?;
            graph.update_edge(dep_node, node, ());
        }
    }

    match toposort(&graph, None) {
        Ok(sorted) => Ok(sorted.into_iter().map(|node| graph[node]).collect()),
        Err(_) => {
            let mut packages: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .flatten()
                .map(|node| graph[node].name.clone())
                .collect();
            packages.sort();
            Err(DependencyError::Cycle { packages })
        }
    }
}
