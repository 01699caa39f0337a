//! Package compilation: the compiled-package cache, the per-package compiler
//! and the dependency-ordered driver over a release.

pub mod dependency;
pub mod package;
pub mod repo;
pub mod runner;

pub use dependency::{CompiledPackages, DependencyCompiler, DependencyError};
pub use package::{
    dependency_key, CompileError, CompileOptions, CompiledPackageRef, PackageCompiler,
    ReleasePackageCompiler, PACKAGING_SCRIPT,
};
pub use repo::{CompiledPackageRecord, CompiledPackageRepo};
pub use runner::{CommandOutcome, CommandRunner, CommandSpec, RunnerError, SystemRunner};
