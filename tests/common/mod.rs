//! Shared fixture: a release directory on disk with real `packaging`
//! scripts, plus an installation manifest pointing at it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use relinst::archive::pack_dir;
use relinst::InstallerConfig;
use relinst_blobstore::sha1_file;
use tempfile::TempDir;

struct PackageDef {
    name: String,
    dependencies: Vec<String>,
    fingerprint: Option<String>,
    sha1: String,
}

struct JobDef {
    name: String,
    packages: Vec<String>,
    templates: Vec<(String, String)>,
}

pub struct ReleaseFixture {
    pub temp: TempDir,
    packages: Vec<PackageDef>,
    jobs: Vec<JobDef>,
}

impl ReleaseFixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("release/packages")).unwrap();
        Self {
            temp,
            packages: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn release_dir(&self) -> PathBuf {
        self.temp.path().join("release")
    }

    pub fn target_dir(&self) -> PathBuf {
        self.temp.path().join("target")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.temp.path().join("install.toml")
    }

    fn runs_log(&self) -> PathBuf {
        self.temp.path().join("runs.log")
    }

    /// Add a package whose packaging script records each run, then runs
    /// `body`.
    pub fn package(&mut self, name: &str, dependencies: &[&str], body: &str) -> &mut Self {
        self.packages.push(PackageDef {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            fingerprint: None,
            sha1: String::new(),
        });
        self.set_script(name, body)
    }

    /// Package that writes `<name> built` into `<name>.txt`.
    pub fn simple_package(&mut self, name: &str, dependencies: &[&str]) -> &mut Self {
        let body = format!("echo \"{} built\" > \"$PKG_INSTALL_TARGET/{}.txt\"\n", name, name);
        self.package(name, dependencies, &body)
    }

    /// Replace a package's packaging script and re-pack its source.
    pub fn set_script(&mut self, name: &str, body: &str) -> &mut Self {
        let runs_log = self.runs_log();
        let source_dir = self.temp.path().join("sources").join(name);
        let archive = self
            .release_dir()
            .join("packages")
            .join(format!("{}.tgz", name));

        let _ = fs::remove_dir_all(&source_dir);
        fs::create_dir_all(&source_dir).unwrap();
        let script = format!(
            "set -e\necho \"$PKG_NAME\" >> \"{}\"\n{}",
            runs_log.display(),
            body
        );
        fs::write(source_dir.join("packaging"), script).unwrap();
        pack_dir(&source_dir, &archive).unwrap();
        let sha1 = sha1_file(&archive).unwrap();

        self.package_def(name).sha1 = sha1;
        self
    }

    pub fn fingerprint(&mut self, name: &str, fingerprint: &str) -> &mut Self {
        self.package_def(name).fingerprint = Some(fingerprint.to_string());
        self
    }

    fn package_def(&mut self, name: &str) -> &mut PackageDef {
        self.packages
            .iter_mut()
            .find(|p| p.name == name)
            .expect("package defined")
    }

    /// Add a job. Templates are `(file name, destination, contents)`.
    pub fn job(
        &mut self,
        name: &str,
        packages: &[&str],
        templates: &[(&str, &str, &str)],
    ) -> &mut Self {
        let job_dir = self.release_dir().join("jobs").join(name);
        fs::create_dir_all(job_dir.join("templates")).unwrap();
        for (file, _, contents) in templates {
            fs::write(job_dir.join("templates").join(file), contents).unwrap();
        }
        fs::write(job_dir.join("monit"), format!("check process {}\n", name)).unwrap();

        self.jobs.push(JobDef {
            name: name.to_string(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            templates: templates
                .iter()
                .map(|(file, dest, _)| (file.to_string(), dest.to_string()))
                .collect(),
        });
        self
    }

    /// Write `release.toml` and an installation manifest with `extra`
    /// appended (jobs, properties, registry).
    pub fn write(&self, extra: &str) -> PathBuf {
        let mut release = String::from("name = \"fixture\"\nversion = \"1.0\"\n");
        for package in &self.packages {
            release.push_str(&format!(
                "\n[[package]]\nname = \"{}\"\nsha1 = \"{}\"\ndependencies = {}\n",
                package.name,
                package.sha1,
                toml_list(&package.dependencies)
            ));
            if let Some(fingerprint) = &package.fingerprint {
                release.push_str(&format!("fingerprint = \"{}\"\n", fingerprint));
            }
        }
        for job in &self.jobs {
            let templates: BTreeMap<_, _> = job.templates.iter().cloned().collect();
            let templates: Vec<String> = templates
                .iter()
                .map(|(file, dest)| format!("\"{}\" = \"{}\"", file, dest))
                .collect();
            release.push_str(&format!(
                "\n[[job]]\nname = \"{}\"\npackages = {}\ntemplates = {{ {} }}\n",
                job.name,
                toml_list(&job.packages),
                templates.join(", ")
            ));
        }
        fs::write(self.release_dir().join("release.toml"), release).unwrap();

        let manifest = format!(
            "name = \"fixture-install\"\nrelease = \"release\"\n{}",
            extra
        );
        fs::write(self.manifest_path(), manifest).unwrap();
        self.manifest_path()
    }

    /// Names of packages whose packaging script ran, in run order.
    pub fn runs(&self) -> Vec<String> {
        fs::read_to_string(self.runs_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn clear_runs(&self) {
        let _ = fs::remove_file(self.runs_log());
    }

    pub fn config(&self) -> InstallerConfig {
        InstallerConfig {
            data_dir: self.temp.path().join("data"),
            shell: "bash".to_string(),
            registry_grace_seconds: 2,
            lock_timeout_seconds: 1,
        }
    }
}

fn toml_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("\"{}\"", i)).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}
