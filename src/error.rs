//! The closed fail-stage taxonomy and the envelope every subsystem wraps
//! its errors in before handing them to the top-level sink.

/// The stage a build failed at, used to pick the right compensating
/// cleanup and to report a stable machine-readable reason. Mirrors the
/// closed tag set a build report's `Fail-Stage:` field is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailStage {
    /// Options/job construction failed before any session existed.
    Init,
    /// Creating or entering the build session failed.
    CreateSession,
    /// Acquiring the chroot-internal exclusive lock failed.
    LockSession,
    /// Creating the build directory inside the session failed.
    CreateBuildDir,
    /// Fetching the source (`.dsc` or `apt-get source`) failed.
    FetchSrc,
    /// Setting up the dependency resolver failed.
    ResolverSetup,
    /// `apt-get update` failed.
    AptGetUpdate,
    /// `apt-get dist-upgrade` failed.
    AptGetDistUpgrade,
    /// `apt-get upgrade` failed.
    AptGetUpgrade,
    /// `apt-get clean` failed.
    AptGetClean,
    /// Installing the reduced build-dependency set failed.
    InstallDeps,
    /// Installing the core/essential toolchain packages failed.
    InstallEssential,
    /// The source package's `Architecture:` field didn't match the host
    /// architecture (scenario: build skipped).
    CheckArchitecture,
    /// There wasn't enough free space to stage the build.
    CheckSpace,
    /// An already-unpacked source directory's changelog version didn't
    /// match what was expected.
    CheckUnpackedVersion,
    /// Adding the binNMU changelog entry failed.
    HackBinNmu,
    /// Unpacking the source (`dpkg-source -x`) failed.
    Unpack,
    /// Dumping the build environment for the log failed.
    DumpBuildEnv,
    /// `dpkg-buildpackage` itself failed.
    DpkgBuildpackage,
    /// The build failed for a reason not attributable to a more specific
    /// stage above (fallback tag used by the high-level pipeline).
    Build,
    /// Explaining why the build-deps were uninstallable failed or was
    /// itself inconclusive.
    ExplainBdUninstallable,
    /// Parsing the resulting `.changes` file failed.
    ParseChanges,
    /// Producing the source-only `.changes` failed.
    SourceOnlyChanges,
    /// A named hook command failed (`pre-build`, `post-build`, ...).
    RunHookCommands(&'static str),
    /// Probing the session's own architecture (for a host-arch default)
    /// failed.
    ChrootArch,
    /// The build was aborted (stall watchdog, signal, user cancellation).
    Abort,
}

impl std::fmt::Display for FailStage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FailStage::Init => write!(f, "init"),
            FailStage::CreateSession => write!(f, "create-session"),
            FailStage::LockSession => write!(f, "lock-session"),
            FailStage::CreateBuildDir => write!(f, "create-build-dir"),
            FailStage::FetchSrc => write!(f, "fetch-src"),
            FailStage::ResolverSetup => write!(f, "resolver-setup"),
            FailStage::AptGetUpdate => write!(f, "apt-get-update"),
            FailStage::AptGetDistUpgrade => write!(f, "apt-get-dist-upgrade"),
            FailStage::AptGetUpgrade => write!(f, "apt-get-upgrade"),
            FailStage::AptGetClean => write!(f, "apt-get-clean"),
            FailStage::InstallDeps => write!(f, "install-deps"),
            FailStage::InstallEssential => write!(f, "install-essential"),
            FailStage::CheckArchitecture => write!(f, "check-architecture"),
            FailStage::CheckSpace => write!(f, "check-space"),
            FailStage::CheckUnpackedVersion => write!(f, "check-unpacked-version"),
            FailStage::HackBinNmu => write!(f, "hack-binNMU"),
            FailStage::Unpack => write!(f, "unpack"),
            FailStage::DumpBuildEnv => write!(f, "dump-build-env"),
            FailStage::DpkgBuildpackage => write!(f, "dpkg-buildpackage"),
            FailStage::Build => write!(f, "build"),
            FailStage::ExplainBdUninstallable => write!(f, "explain-bd-uninstallable"),
            FailStage::ParseChanges => write!(f, "parse-changes"),
            FailStage::SourceOnlyChanges => write!(f, "source-only-changes"),
            FailStage::RunHookCommands(hook) => write!(f, "run-{}-commands", hook),
            FailStage::ChrootArch => write!(f, "chroot-arch"),
            FailStage::Abort => write!(f, "abort"),
        }
    }
}

/// The outcome a build is reported under, orthogonal to [`FailStage`]:
/// a build can fail at a stage, be skipped before any stage runs (e.g.
/// architecture mismatch), or be given back to a scheduler for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The build completed successfully.
    Successful,
    /// The build failed at the tagged [`FailStage`].
    Failed,
    /// The build was never attempted (e.g. `Architecture:` doesn't match
    /// the host and the package isn't `Architecture: all`).
    Skipped,
    /// The build should be retried later (buildd-queue semantics; this
    /// crate's own CLI path never produces this status itself, but
    /// callers embedding it in a buildd-style scheduler may map onto it).
    GivenBack,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Status::Successful => "successful",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::GivenBack => "given-back",
        };
        write!(f, "{}", s)
    }
}

/// A build error tagged with the stage it occurred at, wrapping whatever
/// the failing subsystem's own error type was.
#[derive(Debug)]
pub struct BuildError {
    /// The stage the error occurred at.
    pub stage: FailStage,
    /// The status this error should be reported under.
    pub status: Status,
    /// The underlying error.
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl BuildError {
    /// Tag an error with the stage it occurred at, as an ordinary failure.
    pub fn new(stage: FailStage, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        BuildError {
            stage,
            status: Status::Failed,
            source: Box::new(source),
        }
    }

    /// Tag an error as a skip: the build was never attempted because a
    /// precondition (e.g. architecture match) wasn't met.
    pub fn skipped(stage: FailStage, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        BuildError {
            stage,
            status: Status::Skipped,
            source: Box::new(source),
        }
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.status, self.source)
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_stage_display() {
        assert_eq!(FailStage::CreateSession.to_string(), "create-session");
        assert_eq!(FailStage::HackBinNmu.to_string(), "hack-binNMU");
        assert_eq!(FailStage::RunHookCommands("pre-build").to_string(), "run-pre-build-commands");
    }

    #[test]
    fn test_build_error_display_includes_stage_and_status() {
        let err = BuildError::new(FailStage::Build, std::io::Error::other("boom"));
        assert!(err.to_string().starts_with("[build] failed:"));
    }

    #[test]
    fn test_skipped_build_error_status() {
        let err = BuildError::skipped(FailStage::CheckArchitecture, std::io::Error::other("arch mismatch"));
        assert_eq!(err.status, Status::Skipped);
        assert!(err.to_string().starts_with("[check-architecture] skipped:"));
    }
}
