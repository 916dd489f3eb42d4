//! The flat `Options` bag: every named knob from the external interface,
//! as a typed struct rather than a stringly-typed map, built up through an
//! `OptionsBuilder` the way [`crate::session::ExecutionContext`] composes
//! session defaults with per-call overrides.

use crate::resolver::Explainer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// When a purge knob runs: always, only after a successful build, or never.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgePolicy {
    /// Purge regardless of whether the build succeeded.
    Always,
    /// Purge only if the build succeeded.
    Successful,
    /// Never purge.
    Never,
}

impl PurgePolicy {
    /// Whether this policy says to purge, given that the build `succeeded`.
    pub fn should_purge(self, succeeded: bool) -> bool {
        match self {
            PurgePolicy::Always => true,
            PurgePolicy::Successful => succeeded,
            PurgePolicy::Never => false,
        }
    }
}

/// Which backend drives the build session.
#[derive(Debug, Clone)]
pub enum ChrootSelector {
    /// A direct, unprivileged chroot entered via a launcher binary.
    Direct {
        /// Root of the chroot.
        root: PathBuf,
        /// Launcher argv prefix, e.g. `["chroot"]` or `["schroot", "-c"]`.
        launcher: Vec<String>,
    },
    /// An external chroot manager, addressed by chroot name.
    External {
        /// Argv that starts the manager process.
        manager_cmd: Vec<String>,
        /// The chroot name to open.
        chroot_name: String,
    },
    /// A Linux user-namespace sandbox bootstrapped from a tarball.
    Unshare {
        /// Path to the base tarball, or `None` to bootstrap fresh.
        tarball: Option<PathBuf>,
        /// Debian suite to bootstrap if `tarball` is `None`.
        suite: String,
    },
}

/// Every option the external interface exposes, as one flat, typed
/// struct. Constructed via [`OptionsBuilder`], never as a string-keyed map.
#[derive(Debug, Clone)]
pub struct Options {
    /// Which backend to use and how to reach it.
    pub chroot: ChrootSelector,
    /// The architecture the build should target (`dpkg --print-architecture`
    /// inside the session, by default).
    pub host_arch: Option<String>,
    /// The architecture doing the building (relevant for cross-builds).
    pub build_arch: Option<String>,
    /// Active build profiles (`DEB_BUILD_PROFILES`), e.g. `["nocheck"]`.
    pub build_profiles: Vec<String>,
    /// Build `dpkg-buildpackage -A` (arch-indep only).
    pub arch_indep_only: bool,
    /// Build `dpkg-buildpackage -B` (arch-dependent only).
    pub arch_dep_only: bool,
    /// Run the build as `fakeroot` rather than actual root.
    pub use_fakeroot: bool,
    /// Extra verbatim arguments appended to the `dpkg-buildpackage` argv,
    /// after the fixed flag table and the `--`/fakeroot option.
    pub extra_build_options: Vec<String>,
    /// Whether to sign the `.changes`/`.dsc` produced by the build (passes
    /// `-us -uc` to `dpkg-buildpackage` when `false`, the common case for
    /// an isolated/throwaway build).
    pub sign_build: bool,
    /// When to purge the in-session build directory.
    pub purge_build_dir: PurgePolicy,
    /// When to uninstall the dependencies this job's resolver installed.
    pub purge_deps: PurgePolicy,
    /// When to tear down (purge) the build session itself.
    pub purge_session: PurgePolicy,
    /// Maximum time a command may run without producing output before the
    /// stall watchdog escalates.
    pub stall_timeout: Duration,
    /// How long to wait for the chroot-internal exclusive lock.
    pub lock_timeout: Duration,
    /// How often to retry acquiring the lock within `lock_timeout`.
    pub lock_retry_interval: Duration,
    /// Which resolver backend to use (currently always apt-based; kept as
    /// an option for parity with the external interface).
    pub resolver: ResolverSelector,
    /// Whether the resolver may pick among alternative dependencies
    /// itself, or must fail when a choice is ambiguous.
    pub resolve_alternatives: bool,
    /// Extra dependencies to add for specific architectures when
    /// cross-building (package name -> extra relation field).
    pub cross_core_deps: HashMap<String, String>,
    /// GPG key id used to sign the ephemeral Release file.
    pub signing_key_id: Option<String>,
    /// binNMU changelog entry inputs: (version suffix, maintainer, message).
    pub binnmu: Option<(String, String, String)>,
    /// Directory build logs are written under.
    pub log_dir: Option<PathBuf>,
    /// Hook commands, keyed by hook name (`pre-build`, `post-build`, ...).
    pub hooks: HashMap<String, String>,
    /// Extra binary packages to install before resolving build-deps.
    pub extra_packages: Vec<String>,
    /// Extra `deb`/`deb-src` lines to add to the session's sources list.
    pub extra_repositories: Vec<String>,
    /// Armored OpenPGP keys to trust for `extra_repositories`.
    pub extra_keys: Vec<String>,
    /// Produce a source-only `.changes` (no binary packages).
    pub source_only_changes: bool,
    /// Which tool (if any) explains unsatisfiable build-deps.
    pub bd_uninstallable_explainer: Explainer,
    /// Run `lintian` after a successful build, with these extra arguments.
    pub run_lintian: Option<Vec<String>>,
    /// Run `piuparts` after a successful build, with these extra arguments.
    pub run_piuparts: Option<Vec<String>>,
    /// Run `autopkgtest` after a successful build, with this virt-server argv.
    pub run_autopkgtest: Option<Vec<String>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            chroot: ChrootSelector::Unshare {
                tarball: None,
                suite: "sid".to_string(),
            },
            host_arch: None,
            build_arch: None,
            build_profiles: Vec::new(),
            arch_indep_only: false,
            arch_dep_only: false,
            use_fakeroot: true,
            extra_build_options: Vec::new(),
            sign_build: false,
            purge_build_dir: PurgePolicy::Always,
            purge_deps: PurgePolicy::Successful,
            purge_session: PurgePolicy::Always,
            stall_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(300),
            lock_retry_interval: Duration::from_secs(5),
            resolver: ResolverSelector::Apt,
            resolve_alternatives: false,
            cross_core_deps: HashMap::new(),
            signing_key_id: None,
            binnmu: None,
            log_dir: None,
            hooks: HashMap::new(),
            extra_packages: Vec::new(),
            extra_repositories: Vec::new(),
            extra_keys: Vec::new(),
            source_only_changes: false,
            bd_uninstallable_explainer: Explainer::Off,
            run_lintian: None,
            run_piuparts: None,
            run_autopkgtest: None,
        }
    }
}

impl Options {
    /// Construct the `dpkg-buildpackage` argv this job should run, from the
    /// architecture/profile/signing/fakeroot knobs above.
    ///
    /// The binary-selection flag is the first of this priority order that
    /// applies, mirroring `dpkg-buildpackage(1)`'s own flags: a source-only
    /// request (`-S`) beats restricting to one architecture kind (`-A`/
    /// `-B`), which beats a binNMU rebuild defaulting to binary-only
    /// (`-b`), which beats a plain full source+binary build (no flag).
    pub fn build_command(&self) -> Vec<String> {
        let mut args = vec![crate::pipeline::BUILD_COMMAND_NAME.to_string()];

        let flag = if self.source_only_changes {
            "-S"
        } else if self.arch_indep_only {
            "-A"
        } else if self.arch_dep_only {
            "-B"
        } else if self.binnmu.is_some() {
            "-b"
        } else {
            ""
        };
        if !flag.is_empty() {
            args.push(flag.to_string());
        }

        if !self.build_profiles.is_empty() {
            args.push(format!("-P{}", self.build_profiles.join(",")));
        }

        if self.sign_build {
            if let Some(key_id) = &self.signing_key_id {
                args.push(format!("-k{}", key_id));
            }
        } else {
            args.push("-us".to_string());
            args.push("-uc".to_string());
        }

        if self.use_fakeroot {
            args.push("--root-command=fakeroot".to_string());
        }

        args.extend(self.extra_build_options.iter().cloned());
        args
    }
}

/// Which dependency resolver implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverSelector {
    /// Resolve via `apt`/`apt-get` inside the session.
    Apt,
}

/// Builds an [`Options`] value by applying overrides on top of
/// [`Options::default`].
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: OptionsOverlay,
}

#[derive(Debug, Clone, Default)]
struct OptionsOverlay {
    chroot: Option<ChrootSelector>,
    host_arch: Option<String>,
    build_arch: Option<String>,
    build_profiles: Option<Vec<String>>,
    arch_indep_only: Option<bool>,
    arch_dep_only: Option<bool>,
    stall_timeout: Option<Duration>,
    signing_key_id: Option<String>,
    binnmu: Option<(String, String, String)>,
    log_dir: Option<PathBuf>,
    extra_packages: Option<Vec<String>>,
    source_only_changes: Option<bool>,
    bd_uninstallable_explainer: Option<Explainer>,
    use_fakeroot: Option<bool>,
    extra_build_options: Option<Vec<String>>,
    sign_build: Option<bool>,
    purge_build_dir: Option<PurgePolicy>,
    purge_deps: Option<PurgePolicy>,
    purge_session: Option<PurgePolicy>,
    run_lintian: Option<Option<Vec<String>>>,
    run_piuparts: Option<Option<Vec<String>>>,
    run_autopkgtest: Option<Option<Vec<String>>>,
}

impl OptionsBuilder {
    /// Start building from `Options::default()`.
    pub fn new() -> Self {
        OptionsBuilder::default()
    }

    /// Select the backend.
    pub fn chroot(mut self, chroot: ChrootSelector) -> Self {
        self.options.chroot = Some(chroot);
        self
    }

    /// Set the target architecture.
    pub fn host_arch(mut self, arch: impl Into<String>) -> Self {
        self.options.host_arch = Some(arch.into());
        self
    }

    /// Set the building architecture.
    pub fn build_arch(mut self, arch: impl Into<String>) -> Self {
        self.options.build_arch = Some(arch.into());
        self
    }

    /// Set the active build profiles.
    pub fn build_profiles(mut self, profiles: Vec<String>) -> Self {
        self.options.build_profiles = Some(profiles);
        self
    }

    /// Build architecture-independent packages only.
    pub fn arch_indep_only(mut self, v: bool) -> Self {
        self.options.arch_indep_only = Some(v);
        self
    }

    /// Build architecture-dependent packages only.
    pub fn arch_dep_only(mut self, v: bool) -> Self {
        self.options.arch_dep_only = Some(v);
        self
    }

    /// Override the stall timeout.
    pub fn stall_timeout(mut self, d: Duration) -> Self {
        self.options.stall_timeout = Some(d);
        self
    }

    /// Set the signing key id for the ephemeral Release file.
    pub fn signing_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.options.signing_key_id = Some(key_id.into());
        self
    }

    /// Request a binNMU-style changelog entry.
    pub fn binnmu(mut self, suffix: impl Into<String>, maintainer: impl Into<String>, message: impl Into<String>) -> Self {
        self.options.binnmu = Some((suffix.into(), maintainer.into(), message.into()));
        self
    }

    /// Set the build log directory.
    pub fn log_dir(mut self, dir: PathBuf) -> Self {
        self.options.log_dir = Some(dir);
        self
    }

    /// Add extra packages to install before resolving build-deps.
    pub fn extra_packages(mut self, packages: Vec<String>) -> Self {
        self.options.extra_packages = Some(packages);
        self
    }

    /// Produce a source-only `.changes` file.
    pub fn source_only_changes(mut self, v: bool) -> Self {
        self.options.source_only_changes = Some(v);
        self
    }

    /// Select the build-dep unsatisfiability explainer.
    pub fn bd_uninstallable_explainer(mut self, explainer: Explainer) -> Self {
        self.options.bd_uninstallable_explainer = Some(explainer);
        self
    }

    /// Run the build under `fakeroot` (the default) or as real root.
    pub fn use_fakeroot(mut self, v: bool) -> Self {
        self.options.use_fakeroot = Some(v);
        self
    }

    /// Append verbatim extra arguments to the `dpkg-buildpackage` invocation.
    pub fn extra_build_options(mut self, opts: Vec<String>) -> Self {
        self.options.extra_build_options = Some(opts);
        self
    }

    /// Sign the resulting `.changes`/`.dsc` rather than passing `-us -uc`.
    pub fn sign_build(mut self, v: bool) -> Self {
        self.options.sign_build = Some(v);
        self
    }

    /// Set all three purge knobs (build dir, deps, session) at once.
    pub fn purge_policy(mut self, policy: PurgePolicy) -> Self {
        self.options.purge_build_dir = Some(policy);
        self.options.purge_deps = Some(policy);
        self.options.purge_session = Some(policy);
        self
    }

    /// Set the build-directory purge policy independently.
    pub fn purge_build_dir(mut self, policy: PurgePolicy) -> Self {
        self.options.purge_build_dir = Some(policy);
        self
    }

    /// Set the dependency-uninstall purge policy independently.
    pub fn purge_deps(mut self, policy: PurgePolicy) -> Self {
        self.options.purge_deps = Some(policy);
        self
    }

    /// Set the session-teardown purge policy independently.
    pub fn purge_session(mut self, policy: PurgePolicy) -> Self {
        self.options.purge_session = Some(policy);
        self
    }

    /// Run `lintian` after a successful build, with `extra_args`.
    pub fn run_lintian(mut self, extra_args: Vec<String>) -> Self {
        self.options.run_lintian = Some(Some(extra_args));
        self
    }

    /// Run `piuparts` after a successful build, with `extra_args`.
    pub fn run_piuparts(mut self, extra_args: Vec<String>) -> Self {
        self.options.run_piuparts = Some(Some(extra_args));
        self
    }

    /// Run `autopkgtest` after a successful build, with `virt_server` argv.
    pub fn run_autopkgtest(mut self, virt_server: Vec<String>) -> Self {
        self.options.run_autopkgtest = Some(Some(virt_server));
        self
    }

    /// Apply the overrides on top of the defaults.
    pub fn build(self) -> Options {
        let defaults = Options::default();
        Options {
            chroot: self.options.chroot.unwrap_or(defaults.chroot),
            host_arch: self.options.host_arch.or(defaults.host_arch),
            build_arch: self.options.build_arch.or(defaults.build_arch),
            build_profiles: self.options.build_profiles.unwrap_or(defaults.build_profiles),
            arch_indep_only: self.options.arch_indep_only.unwrap_or(defaults.arch_indep_only),
            arch_dep_only: self.options.arch_dep_only.unwrap_or(defaults.arch_dep_only),
            stall_timeout: self.options.stall_timeout.unwrap_or(defaults.stall_timeout),
            signing_key_id: self.options.signing_key_id.or(defaults.signing_key_id),
            binnmu: self.options.binnmu.or(defaults.binnmu),
            log_dir: self.options.log_dir.or(defaults.log_dir),
            extra_packages: self.options.extra_packages.unwrap_or(defaults.extra_packages),
            source_only_changes: self.options.source_only_changes.unwrap_or(defaults.source_only_changes),
            bd_uninstallable_explainer: self
                .options
                .bd_uninstallable_explainer
                .unwrap_or(defaults.bd_uninstallable_explainer),
            use_fakeroot: self.options.use_fakeroot.unwrap_or(defaults.use_fakeroot),
            extra_build_options: self.options.extra_build_options.unwrap_or(defaults.extra_build_options),
            sign_build: self.options.sign_build.unwrap_or(defaults.sign_build),
            purge_build_dir: self.options.purge_build_dir.unwrap_or(defaults.purge_build_dir),
            purge_deps: self.options.purge_deps.unwrap_or(defaults.purge_deps),
            purge_session: self.options.purge_session.unwrap_or(defaults.purge_session),
            run_lintian: self.options.run_lintian.unwrap_or(defaults.run_lintian),
            run_piuparts: self.options.run_piuparts.unwrap_or(defaults.run_piuparts),
            run_autopkgtest: self.options.run_autopkgtest.unwrap_or(defaults.run_autopkgtest),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_purge_policy() {
        let opts = Options::default();
        assert_eq!(opts.purge_build_dir, PurgePolicy::Always);
        assert_eq!(opts.purge_deps, PurgePolicy::Successful);
        assert_eq!(opts.purge_session, PurgePolicy::Always);
    }

    #[test]
    fn test_builder_overrides_default() {
        let opts = OptionsBuilder::new().host_arch("arm64").build();
        assert_eq!(opts.host_arch.as_deref(), Some("arm64"));
        assert_eq!(opts.purge_deps, PurgePolicy::Successful);
    }

    #[test]
    fn test_builder_purge_policy_sets_all_three() {
        let opts = OptionsBuilder::new().purge_policy(PurgePolicy::Never).build();
        assert_eq!(opts.purge_build_dir, PurgePolicy::Never);
        assert_eq!(opts.purge_deps, PurgePolicy::Never);
        assert_eq!(opts.purge_session, PurgePolicy::Never);
    }

    #[test]
    fn test_purge_policy_should_purge() {
        assert!(PurgePolicy::Always.should_purge(false));
        assert!(PurgePolicy::Successful.should_purge(true));
        assert!(!PurgePolicy::Successful.should_purge(false));
        assert!(!PurgePolicy::Never.should_purge(true));
    }

    #[test]
    fn test_builder_arch_only_flags() {
        let opts = OptionsBuilder::new().arch_dep_only(true).build();
        assert!(opts.arch_dep_only);
        assert!(!opts.arch_indep_only);
    }

    #[test]
    fn test_build_command_default_is_full_build_unsigned_fakeroot() {
        let opts = Options::default();
        assert_eq!(
            opts.build_command(),
            vec!["dpkg-buildpackage", "-us", "-uc", "--root-command=fakeroot"]
        );
    }

    #[test]
    fn test_build_command_arch_indep_only() {
        let opts = OptionsBuilder::new().arch_indep_only(true).build();
        assert_eq!(
            opts.build_command(),
            vec!["dpkg-buildpackage", "-A", "-us", "-uc", "--root-command=fakeroot"]
        );
    }

    #[test]
    fn test_build_command_arch_dep_only() {
        let opts = OptionsBuilder::new().arch_dep_only(true).build();
        assert_eq!(
            opts.build_command(),
            vec!["dpkg-buildpackage", "-B", "-us", "-uc", "--root-command=fakeroot"]
        );
    }

    #[test]
    fn test_build_command_source_only_changes_overrides_arch_flags() {
        let opts = OptionsBuilder::new().arch_dep_only(true).source_only_changes(true).build();
        assert_eq!(
            opts.build_command(),
            vec!["dpkg-buildpackage", "-S", "-us", "-uc", "--root-command=fakeroot"]
        );
    }

    #[test]
    fn test_build_command_binnmu_forces_binary_only() {
        let opts = OptionsBuilder::new().binnmu("+b1", "Buildd <b@example.com>", "Binary rebuild.").build();
        assert_eq!(
            opts.build_command(),
            vec!["dpkg-buildpackage", "-b", "-us", "-uc", "--root-command=fakeroot"]
        );
    }

    #[test]
    fn test_build_command_signed_uses_key_id_not_us_uc() {
        let opts = OptionsBuilder::new().sign_build(true).signing_key_id("ABCDEF").build();
        let cmd = opts.build_command();
        assert!(cmd.contains(&"-kABCDEF".to_string()));
        assert!(!cmd.contains(&"-us".to_string()));
    }

    #[test]
    fn test_build_command_profiles_and_extra_options() {
        let opts = OptionsBuilder::new()
            .build_profiles(vec!["nocheck".to_string(), "cross".to_string()])
            .extra_build_options(vec!["-j4".to_string()])
            .build();
        let cmd = opts.build_command();
        assert!(cmd.contains(&"-Pnocheck,cross".to_string()));
        assert_eq!(cmd.last().unwrap(), "-j4");
    }

    #[test]
    fn test_build_command_no_fakeroot() {
        let opts = OptionsBuilder::new().use_fakeroot(false).build();
        assert!(!opts.build_command().iter().any(|a| a.contains("fakeroot")));
    }
}
