//! Job: ties the session, source fetcher, ephemeral repo, resolver, and
//! pipeline together into the single `run_job` entrypoint a CLI or library
//! caller drives.
//!
//! No single teacher file does this (the teacher's binaries each wire up
//! one piece directly); `run_job`'s stage sequencing follows the same
//! create → install-deps → build → validate → collect → teardown order
//! `debian::build::build_once` and `debian::apt`'s install/uninstall pair
//! already imply, generalized across the new session/resolver/pipeline
//! modules and wrapped in [`crate::error::BuildError`] per stage.

use crate::archive::{self, DummyPackage, EphemeralRepoRequest};
use crate::command::{substitute_percent_escapes, HookContext};
use crate::error::{BuildError, FailStage};
use crate::options::{ChrootSelector, Options};
use crate::relations::{self, DependencyRecord};
use crate::resolver::AptResolver;
use crate::session::{Backend, Session};
use crate::source::{self, SourceRef};
use crate::{log_mux, pipeline, session_manager};
use std::path::{Path, PathBuf};

/// Everything a completed job produced.
pub struct JobResult {
    /// Source package name.
    pub source_package: String,
    /// Built version.
    pub version: String,
    /// Paths (on the host) to the collected `.changes` files.
    pub changes_files: Vec<PathBuf>,
    /// Output of each validator that ran, keyed by validator name.
    pub validator_output: Vec<(String, bool, Vec<String>)>,
}

/// One build job: where the source comes from plus the options describing
/// how to isolate, resolve, build, and validate it.
pub struct Job {
    /// Where the source package to build comes from.
    pub source: SourceRef,
    /// Directory collected artifacts are written to, on the host.
    pub output_dir: PathBuf,
    /// The options controlling every stage of the build.
    pub options: Options,
}

impl Job {
    /// Construct a job fetching `source`, writing artifacts to `output_dir`.
    pub fn new(source: SourceRef, output_dir: PathBuf, options: Options) -> Self {
        Job { source, output_dir, options }
    }

    /// Open the session backend this job's [`ChrootSelector`] describes.
    fn open_session(&self) -> Result<Backend, BuildError> {
        match &self.options.chroot {
            ChrootSelector::Direct { root, launcher } => Ok(Backend::Direct(crate::session::direct::DirectSession::new(
                root.clone(),
                launcher.clone(),
            ))),
            ChrootSelector::External { manager_cmd, chroot_name } => {
                let argv: Vec<&str> = manager_cmd.iter().map(String::as_str).collect();
                crate::session::external::ExternalSession::open(&argv, chroot_name)
                    .map(Backend::External)
                    .map_err(|e| BuildError::new(FailStage::CreateSession, e))
            }
            ChrootSelector::Unshare { tarball, suite } => {
                let session = match tarball {
                    Some(path) => crate::session::unshare::UnshareSession::from_tarball(path),
                    None => crate::session::unshare::UnshareSession::cached_debian_session(suite, true),
                }
                .map_err(|e| BuildError::new(FailStage::CreateSession, e))?;
                Ok(Backend::Unshare(Box::new(session)))
            }
        }
    }

    /// Read the source package's merged, reduced build-dependency and
    /// build-conflict relation fields out of `debian/control` at
    /// `control_path` (a host path, once the tree has been staged/unpacked).
    fn read_build_deps(
        &self,
        control_path: &Path,
        host_arch: &str,
        build_profiles: &[String],
    ) -> Result<(Option<String>, Option<String>), BuildError> {
        let f = std::fs::File::open(control_path).map_err(|e| BuildError::new(FailStage::ResolverSetup, e))?;
        let control = debian_control::Control::read(f)
            .map_err(|e| BuildError::new(FailStage::ResolverSetup, std::io::Error::other(e.to_string())))?;
        let source = control
            .source()
            .ok_or_else(|| BuildError::new(FailStage::ResolverSetup, std::io::Error::other("no Source stanza in debian/control")))?;

        let mut depends_fields = Vec::new();
        if let Some(r) = source.build_depends() {
            depends_fields.push(r);
        }
        if !self.options.arch_indep_only {
            if let Some(r) = source.build_depends_arch() {
                depends_fields.push(r);
            }
        }
        if !self.options.arch_dep_only {
            if let Some(r) = source.build_depends_indep() {
                depends_fields.push(r);
            }
        }

        let mut conflicts_fields = Vec::new();
        if let Some(r) = source.build_conflicts() {
            conflicts_fields.push(r);
        }
        if let Some(r) = source.build_conflicts_arch() {
            conflicts_fields.push(r);
        }
        if let Some(r) = source.build_conflicts_indep() {
            conflicts_fields.push(r);
        }

        let build_arch = self.options.build_arch.as_deref().unwrap_or(host_arch);
        let depends = merge_reduced(depends_fields, host_arch, build_arch, build_profiles);
        let conflicts = merge_reduced(conflicts_fields, host_arch, build_arch, build_profiles);
        Ok((depends, conflicts))
    }

    /// Run the hook registered under `stage`, if any, substituting
    /// percent-escapes into its argv with `ctx` before executing it inside
    /// `session`.
    fn run_hook(&self, session: &dyn Session, stage: &'static str, ctx: &HookContext) -> Result<(), BuildError> {
        let Some(template) = self.options.hooks.get(stage) else {
            return Ok(());
        };
        let substituted = substitute_percent_escapes(template, ctx);
        let argv = shlex::split(&substituted)
            .ok_or_else(|| BuildError::new(FailStage::RunHookCommands(stage), std::io::Error::other(format!("unparsable {} hook command", stage))))?;
        log::info!("running {} hook: {}", stage, substituted);
        session
            .command(argv.iter().map(String::as_str).collect())
            .check_call()
            .map_err(|e| BuildError::new(FailStage::RunHookCommands(stage), e))
    }

    /// Run every stage for this job.
    pub fn run(&self) -> Result<JobResult, BuildError> {
        let mut logs = match &self.options.log_dir {
            Some(dir) => log_mux::DirectoryLogManager::new(dir.join("build.log"), log_mux::LogMode::Copy),
            None => {
                return self.run_inner();
            }
        };
        log_mux::wrap(&mut logs, || self.run_inner())
    }

    fn run_inner(&self) -> Result<JobResult, BuildError> {
        log::info!("{}", log_mux::section_marker("Creating session"));
        let backend = self.open_session()?;
        let session = backend.session();

        let lock_path = Path::new("/tmp/.ipbo-lock");
        let _lock = session_manager::acquire_lock(session, lock_path, self.options.lock_timeout, self.options.lock_retry_interval)
            .map_err(|e| BuildError::new(FailStage::LockSession, e))?;

        let host_arch = match &self.options.host_arch {
            Some(arch) => arch.clone(),
            None => String::from_utf8_lossy(
                &session
                    .command(vec!["dpkg", "--print-architecture"])
                    .check_output()
                    .map_err(|e| BuildError::new(FailStage::ChrootArch, e))?,
            )
            .trim()
            .to_string(),
        };
        if let Some(expected) = &self.options.host_arch {
            session_manager::check_architecture(session, expected).map_err(|e| BuildError::new(FailStage::ChrootArch, e))?;
        }

        log::info!("{}", log_mux::section_marker("Fetching source"));
        let (tree_dir, dsc_path) = match &self.source {
            SourceRef::Directory(dir) => {
                let project = session
                    .project_from_directory(dir, None)
                    .map_err(|e| BuildError::new(FailStage::CreateBuildDir, e))?;
                (project.internal_path().to_path_buf(), None)
            }
            _ => {
                let work_dir = session.location().join("ipbo-src");
                let fetched = self.source.fetch(session, &work_dir).map_err(|e| BuildError::new(FailStage::FetchSrc, e))?;
                let dsc_path = match &fetched {
                    source::FetchedSource::NeedsUnpack { dsc_path, .. } => Some(dsc_path.display().to_string()),
                    source::FetchedSource::Unpacked(_) => None,
                };
                let unpacked = source::unpack(session, &work_dir, fetched).map_err(|e| BuildError::new(FailStage::Unpack, e))?;
                (unpacked, dsc_path)
            }
        };
        let source_dir_host = session.external_path(&tree_dir);
        let control_path = source_dir_host.join("debian/control");
        let source_name = read_source_name(&source_dir_host).map_err(|e| BuildError::new(FailStage::ResolverSetup, e))?;

        log::info!("{}", log_mux::section_marker("Checking architecture"));
        let architecture_field = read_source_architecture(&control_path).map_err(|e| BuildError::new(FailStage::CheckArchitecture, e))?;
        if !relations::source_architecture_matches(&architecture_field, &host_arch) {
            return Err(BuildError::skipped(
                FailStage::CheckArchitecture,
                std::io::Error::other(format!(
                    "{} has Architecture: {}, which doesn't match host architecture {}",
                    source_name, architecture_field, host_arch
                )),
            ));
        }

        log::info!("{}", log_mux::section_marker("Building ephemeral repository"));
        let (depends, conflicts) = self.read_build_deps(&control_path, &host_arch, &self.options.build_profiles)?;
        let dummy = DummyPackage {
            name: format!("{}-build-deps", source_name),
            version: "0".to_string(),
            architecture: self.options.build_arch.clone().unwrap_or_else(|| host_arch.clone()),
            depends,
            conflicts,
        };
        let repo_root = session.location().join("ipbo-ephemeral-repo");
        let repo = archive::build_ephemeral_repo(EphemeralRepoRequest {
            session,
            root: repo_root,
            dummy_package: dummy,
            architectures: vec![host_arch.clone()],
            suite: "ipbo".to_string(),
            signing_key: self.options.signing_key_id.as_deref(),
            now: epoch_to_datetime(),
        })
        .map_err(|e| BuildError::new(FailStage::ResolverSetup, e))?;

        log::info!("{}", log_mux::section_marker("Installing build dependencies"));
        let mut resolver = AptResolver::from_session(session, self.options.bd_uninstallable_explainer);
        resolver
            .install_core_deps(&["build-essential", "fakeroot"])
            .map_err(|e| BuildError::new(FailStage::InstallEssential, e))?;
        for extra in &self.options.extra_packages {
            let dep = DependencyRecord::new(extra);
            resolver.satisfy(&dep).map_err(|e| BuildError::new(FailStage::InstallDeps, e))?;
        }
        resolver
            .install_main_deps(&repo.dummy_package.name)
            .map_err(|e| BuildError::new(FailStage::InstallDeps, e))?;

        let mut hook_ctx = HookContext {
            changes_filename: None,
            dsc_path,
            pkgbuild_dir: Some(tree_dir.display().to_string()),
            chroot_dir: Some(session.location().display().to_string()),
            chroot_exec: Some(chroot_exec_prefix(&self.options.chroot, session)),
            shell: Some("/bin/sh".to_string()),
        };
        self.run_hook(session, "pre-build", &hook_ctx)?;

        log::info!("{}", log_mux::section_marker("Building"));
        let build_command = self.options.build_command();
        let output_dir_in_session = tree_dir.parent().unwrap_or(&tree_dir).to_path_buf();
        let binnmu = self.options.binnmu.as_ref().map(|(suffix, maintainer, message)| {
            let (name, email) = split_maintainer(maintainer);
            (suffix.as_str(), name, email, message.as_str())
        });
        let build_outcome = pipeline::attempt_build(
            session,
            &tree_dir,
            &output_dir_in_session,
            &build_command,
            Some("ipbo"),
            binnmu.as_ref().map(|(s, n, e, m)| (*s, n.as_str(), e.as_str(), *m)),
            None,
            self.options.stall_timeout,
        );
        let succeeded = build_outcome.is_ok();

        log::info!("{}", log_mux::section_marker("Validating"));
        let mut validator_output = Vec::new();
        if let Ok(result) = &build_outcome {
            for changes_path in &result.changes_files {
                if let Some(args) = &self.options.run_lintian {
                    run_validator(&pipeline::Lintian { extra_args: args.clone() }, session, changes_path, &mut validator_output);
                }
                if let Some(args) = &self.options.run_piuparts {
                    run_validator(&pipeline::Piuparts { extra_args: args.clone() }, session, changes_path, &mut validator_output);
                }
                if let Some(virt) = &self.options.run_autopkgtest {
                    run_validator(&pipeline::Autopkgtest { virt_server: virt.clone() }, session, changes_path, &mut validator_output);
                }
            }
        }

        log::info!("{}", log_mux::section_marker("Collecting artifacts"));
        let mut collected = Vec::new();
        let mut result_version = None;
        let mut result_source_package = source_name.clone();
        if let Ok(result) = &build_outcome {
            std::fs::create_dir_all(&self.output_dir).map_err(|e| BuildError::new(FailStage::ParseChanges, e))?;
            for changes_path in &result.changes_files {
                let host_path = session.external_path(changes_path);
                let dest = self.output_dir.join(host_path.file_name().unwrap());
                std::fs::copy(&host_path, &dest).map_err(|e| BuildError::new(FailStage::ParseChanges, e))?;
                collected.push(dest);
            }
            result_version = Some(result.version.to_string());
            result_source_package = result.source_package.clone();
        }

        hook_ctx.changes_filename = collected.first().and_then(|p| p.file_name()).map(|n| n.to_string_lossy().to_string());
        if let Err(e) = self.run_hook(session, "post-build", &hook_ctx) {
            log::warn!("post-build hook failed: {}", e);
        }

        log::info!("{}", log_mux::section_marker("Cleaning up"));
        if self.options.purge_build_dir.should_purge(succeeded) {
            if let Err(e) = session.rmtree(&tree_dir) {
                log::warn!("failed to purge build directory {}: {}", tree_dir.display(), e);
            }
        }
        if self.options.purge_deps.should_purge(succeeded) {
            if let Err(e) = resolver.uninstall_deps() {
                log::warn!("failed to uninstall build dependencies: {}", e);
            }
        }
        if !self.options.purge_session.should_purge(succeeded) && session.is_temporary() {
            // Caller asked to keep this session around for inspection:
            // skip its teardown instead of letting `backend` drop normally.
            std::mem::forget(backend);
        }

        // `BuildOnceError::Detailed` carries a `Box<dyn Problem>` that isn't
        // required to be `Send + Sync`, so it can't flow into `BuildError`
        // directly; its `Display` already renders the stage/phase/reason.
        build_outcome.map_err(|e| BuildError::new(FailStage::Build, std::io::Error::other(e.to_string())))?;

        Ok(JobResult {
            source_package: result_source_package,
            version: result_version.unwrap_or_default(),
            changes_files: collected,
            validator_output,
        })
    }
}

fn run_validator(validator: &dyn pipeline::Validator, session: &dyn Session, changes_path: &Path, out: &mut Vec<(String, bool, Vec<String>)>) {
    match validator.run(session, changes_path) {
        Ok((ok, lines)) => out.push((validator.name().to_string(), ok, lines)),
        Err(e) => {
            log::warn!("{} failed to run: {}", validator.name(), e);
            out.push((validator.name().to_string(), false, vec![e.to_string()]));
        }
    }
}

/// Union every `Binary:` paragraph's `Architecture:` field in
/// `debian/control` into one space-separated wildcard list — the `Source:`
/// paragraph itself carries no `Architecture:` field of its own. Falls
/// back to `any` if no binary paragraph declares one.
fn read_source_architecture(control_path: &Path) -> std::io::Result<String> {
    let f = std::fs::File::open(control_path)?;
    let control = debian_control::Control::read(f).map_err(std::io::Error::other)?;
    let mut terms: Vec<String> = control.binaries().filter_map(|b| b.architecture().map(|a| a.to_string())).collect();
    if terms.is_empty() {
        terms.push("any".to_string());
    }
    terms.sort();
    terms.dedup();
    Ok(terms.join(" "))
}

fn chroot_exec_prefix(chroot: &ChrootSelector, session: &dyn Session) -> String {
    match chroot {
        ChrootSelector::Direct { launcher, .. } => launcher.join(" "),
        ChrootSelector::External { .. } => String::new(),
        ChrootSelector::Unshare { .. } => format!("unshare --root {} --", session.location().display()),
    }
}

fn merge_reduced(
    fields: Vec<debian_control::lossless::relations::Relations>,
    host_arch: &str,
    build_arch: &str,
    build_profiles: &[String],
) -> Option<String> {
    let merged: Vec<String> = fields
        .into_iter()
        .map(DependencyRecord::from)
        .map(|d| d.reduce_for_build(host_arch, build_arch, build_profiles).to_string())
        .filter(|s| !s.trim().is_empty())
        .collect();
    if merged.is_empty() {
        None
    } else {
        Some(merged.join(", "))
    }
}

fn read_source_name(source_dir: &Path) -> std::io::Result<String> {
    let f = std::fs::File::open(source_dir.join("debian/control"))?;
    let control = debian_control::Control::read(f).map_err(std::io::Error::other)?;
    control
        .source()
        .and_then(|s| s.name())
        .ok_or_else(|| std::io::Error::other("no Source: field in debian/control"))
}

fn split_maintainer(spec: &str) -> (String, String) {
    match spec.split_once('<') {
        Some((name, rest)) => (name.trim().to_string(), rest.trim_end_matches('>').trim().to_string()),
        None => (spec.to_string(), String::new()),
    }
}

fn epoch_to_datetime() -> chrono::DateTime<chrono::Utc> {
    match std::env::var("SOURCE_DATE_EPOCH").ok().and_then(|s| s.parse::<i64>().ok()) {
        Some(secs) => chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        None => chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_maintainer_with_email() {
        assert_eq!(
            split_maintainer("Buildd User <buildd@example.com>"),
            ("Buildd User".to_string(), "buildd@example.com".to_string())
        );
    }

    #[test]
    fn test_split_maintainer_without_email() {
        assert_eq!(split_maintainer("Buildd User").0, "Buildd User");
    }

    #[test]
    fn test_read_source_architecture_falls_back_to_any_without_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("debian")).unwrap();
        std::fs::write(dir.path().join("debian/control"), "Source: hello\nMaintainer: Nobody <nobody@example.com>\n").unwrap();
        let arch = read_source_architecture(&dir.path().join("debian/control")).unwrap();
        assert_eq!(arch, "any");
    }
}
