//! Build Pipeline: runs `dpkg-buildpackage` inside a session, classifies
//! failures via `buildlog-consultant`, and locates the resulting artifacts.
//!
//! Generalizes `debian::build`'s `build_once`/`attempt_build`/
//! `version_add_suffix`/`add_dummy_changelog_entry`/`find_changes_files`
//! away from `breezyshim`'s `WorkingTree` abstraction and `sbuild`/`bzr
//! builddeb` invocation, onto a plain filesystem tree staged inside a
//! [`crate::session::Session`] and a direct `dpkg-buildpackage` run.

use crate::session::Session;
use buildlog_consultant::sbuild::{worker_failure_from_sbuild_log, Phase, SbuildLog};
use buildlog_consultant::Problem;
use debian_changelog::{ChangeLog, Urgency};
use debversion::Version;
use std::path::{Path, PathBuf};

/// The binary name every build command starts with.
pub const BUILD_COMMAND_NAME: &str = "dpkg-buildpackage";

/// Name the raw build log is written under inside the output directory.
pub const BUILD_LOG_FILENAME: &str = "build.log";

/// A single failed build attempt, with whatever diagnosis
/// `buildlog-consultant` could extract from the log.
#[derive(Debug)]
pub enum BuildOnceError {
    /// A specific problem was identified from the build log.
    Detailed {
        /// The sbuild-style stage the failure happened in, if known.
        stage: Option<String>,
        /// The sbuild-style phase the failure happened in, if known.
        phase: Option<Phase>,
        /// Process exit code.
        retcode: i32,
        /// The command that was run.
        command: Vec<String>,
        /// The diagnosed problem.
        error: Box<dyn Problem>,
        /// Human-readable description.
        description: String,
    },
    /// No specific problem could be identified.
    Unidentified {
        /// The sbuild-style stage the failure happened in, if known.
        stage: Option<String>,
        /// The sbuild-style phase the failure happened in, if known.
        phase: Option<Phase>,
        /// Process exit code.
        retcode: i32,
        /// The command that was run.
        command: Vec<String>,
        /// Human-readable description.
        description: String,
    },
    /// The session itself failed running the build command.
    Session(crate::session::Error),
}

impl std::fmt::Display for BuildOnceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BuildOnceError::Detailed { description, .. } => write!(f, "{}", description),
            BuildOnceError::Unidentified { description, .. } => write!(f, "{}", description),
            BuildOnceError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BuildOnceError {}

impl From<crate::session::Error> for BuildOnceError {
    fn from(e: crate::session::Error) -> Self {
        BuildOnceError::Session(e)
    }
}

impl From<std::io::Error> for BuildOnceError {
    fn from(e: std::io::Error) -> Self {
        BuildOnceError::Session(crate::session::Error::IoError(e))
    }
}

/// What a successful build produced.
pub struct BuildOnceResult {
    /// Source package name.
    pub source_package: String,
    /// Built version.
    pub version: Version,
    /// Paths (inside the session) to the generated `.changes` files, one
    /// per architecture (or `source` for a source-only build).
    pub changes_files: Vec<PathBuf>,
}

/// Is `debian/control` (and the rest of `debian/`) in the root of the
/// staged tree, or is the tree itself the `debian/` directory?
fn control_files_in_root(tree_root: &Path) -> bool {
    !tree_root.join("debian").is_dir() && tree_root.join("control").exists()
}

fn changelog_path(tree_root: &Path) -> PathBuf {
    if control_files_in_root(tree_root) {
        tree_root.join("changelog")
    } else {
        tree_root.join("debian/changelog")
    }
}

/// Read the package name and version out of the first `debian/changelog`
/// entry in the staged tree (seen from the host).
pub fn last_changelog_entry(tree_root: &Path) -> std::io::Result<(String, Version)> {
    let f = std::fs::File::open(changelog_path(tree_root))?;
    let cl = ChangeLog::read_relaxed(f).map_err(std::io::Error::other)?;
    let entry = cl.iter().next().ok_or_else(|| std::io::Error::other("empty changelog"))?;
    Ok((
        entry.package().ok_or_else(|| std::io::Error::other("changelog entry has no package"))?,
        entry.version().ok_or_else(|| std::io::Error::other("changelog entry has no version"))?,
    ))
}

/// Add `suffix` to `version`, incrementing a trailing counter if the
/// suffix is already present (so repeated binNMU-style rebuilds of the
/// same upload each get a fresh version).
pub fn version_add_suffix(version: &Version, suffix: &str) -> Version {
    fn add_suffix(v: &str, suffix: &str) -> String {
        if let Some(m) = regex::Regex::new(&format!("(.*)({})([0-9]+)", regex::escape(suffix)))
            .unwrap()
            .captures(v)
        {
            let main = m.get(1).unwrap().as_str();
            let suffix = m.get(2).unwrap().as_str();
            let revision = m.get(3).unwrap().as_str();
            format!("{}{}{}", main, suffix, revision.parse::<u64>().unwrap() + 1)
        } else {
            format!("{}{}1", v, suffix)
        }
    }

    let mut version = version.clone();
    if let Some(r) = version.debian_revision {
        version.debian_revision = Some(add_suffix(&r, suffix));
    } else {
        version.upstream_version = add_suffix(&version.upstream_version, suffix);
    }
    version
}

/// Append a dummy changelog entry (a binNMU-style rebuild stanza) to the
/// staged tree's changelog, bumping the version with [`version_add_suffix`].
/// Returns the new version.
pub fn add_dummy_changelog_entry(
    tree_root: &Path,
    suffix: &str,
    suite: &str,
    message: &str,
    maintainer: (String, String),
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
) -> std::io::Result<Version> {
    let path = changelog_path(tree_root);
    let f = std::fs::File::open(&path)?;
    let mut cl = ChangeLog::read_relaxed(f).map_err(std::io::Error::other)?;

    let prev_version = cl
        .iter()
        .next()
        .and_then(|e| e.version())
        .ok_or_else(|| std::io::Error::other("empty changelog"))?;
    let version = version_add_suffix(&prev_version, suffix);

    log::debug!("adding dummy changelog entry {} for build", &version);
    let mut entry = cl.auto_add_change(&[&format!("* {}", message)], maintainer, timestamp.map(|t| t.into()), Some(Urgency::Low));
    entry.set_version(&version);
    entry.set_distributions(vec![suite.to_string()]);

    std::fs::write(&path, cl.to_string())?;
    Ok(entry.version().unwrap())
}

/// Find every `.changes` file in `dir` matching `package`/`version`,
/// returning the architecture tag (or `"source"`) each was built for.
pub fn find_changes_files(dir: &Path, package: &str, version: &Version) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut non_epoch_version = version.upstream_version.to_string();
    if let Some(debian_version) = version.debian_revision.as_ref() {
        non_epoch_version.push_str(&format!("-{}", debian_version));
    }
    let pattern = format!("{}_{}_(.*)\\.changes$", regex::escape(package), regex::escape(&non_epoch_version));
    let re = regex::Regex::new(&pattern).unwrap();

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(m) = re.captures(&name) {
            found.push((m.get(1).unwrap().as_str().to_string(), entry.path()));
        }
    }
    Ok(found)
}

/// Run `build_command` (a full argv, see [`crate::options::Options`]'s
/// build-flag fields for how it's constructed) inside `session`, in
/// `tree_dir`, tee-ing output to `output_dir/build.log`.
fn run_build(
    session: &dyn Session,
    tree_dir: &Path,
    output_dir: &Path,
    build_command: &[String],
    extra_env: std::collections::HashMap<String, String>,
    stall_timeout: std::time::Duration,
) -> Result<(), BuildOnceError> {
    let argv: Vec<&str> = build_command.iter().map(String::as_str).collect();
    log::info!("building: running {:?} in {}", argv, tree_dir.display());

    let (status, lines) = session
        .command(argv.clone())
        .cwd(tree_dir)
        .env(extra_env)
        .run_with_tee_and_watchdog(stall_timeout)?;

    let log_path = session.external_path(&output_dir.join(BUILD_LOG_FILENAME));
    std::fs::write(&log_path, lines.join("\n"))?;

    if status.success() {
        return Ok(());
    }

    let retcode = status.code().unwrap_or(1);
    let sbuild_log = SbuildLog::try_from(std::fs::File::open(&log_path)?).map_err(|e| {
        BuildOnceError::Unidentified {
            stage: None,
            phase: None,
            retcode,
            command: argv.iter().map(|s| s.to_string()).collect(),
            description: format!("build failed with exit code {} (log unparsable: {})", retcode, e),
        }
    })?;
    let failure = worker_failure_from_sbuild_log(&sbuild_log);

    if let Some(error) = failure.error {
        Err(BuildOnceError::Detailed {
            stage: failure.stage,
            phase: failure.phase,
            retcode,
            command: argv.iter().map(|s| s.to_string()).collect(),
            error,
            description: failure.description.unwrap_or_default(),
        })
    } else {
        Err(BuildOnceError::Unidentified {
            stage: failure.stage,
            phase: failure.phase,
            retcode,
            command: argv.iter().map(|s| s.to_string()).collect(),
            description: failure
                .description
                .unwrap_or_else(|| format!("build failed with exit code {}", retcode)),
        })
    }
}

/// Build once and classify any failure; on success locate the resulting
/// `.changes` files.
pub fn build_once(
    session: &dyn Session,
    tree_dir: &Path,
    output_dir: &Path,
    build_command: &[String],
    source_date_epoch: Option<chrono::DateTime<chrono::Utc>>,
    stall_timeout: std::time::Duration,
) -> Result<BuildOnceResult, BuildOnceError> {
    let mut env = std::collections::HashMap::new();
    if let Some(epoch) = source_date_epoch {
        env.insert("SOURCE_DATE_EPOCH".to_string(), epoch.timestamp().to_string());
    }

    run_build(session, tree_dir, output_dir, build_command, env, stall_timeout)?;

    let tree_root = session.external_path(tree_dir);
    let (package, version) = last_changelog_entry(&tree_root)?;
    let output_root = session.external_path(output_dir);
    let changes_files = find_changes_files(&output_root, &package, &version)?
        .into_iter()
        .map(|(_arch, path)| path)
        .collect();

    Ok(BuildOnceResult {
        source_package: package,
        version,
        changes_files,
    })
}

/// Like [`build_once`], but first adds a dummy changelog entry (for
/// binNMU-style rebuilds) when `binnmu` is given.
#[allow(clippy::too_many_arguments)]
pub fn attempt_build(
    session: &dyn Session,
    tree_dir: &Path,
    output_dir: &Path,
    build_command: &[String],
    build_suite: Option<&str>,
    binnmu: Option<(&str, &str, &str, &str)>, // (suffix, maintainer_name, maintainer_email, message)
    source_date_epoch: Option<chrono::DateTime<chrono::Utc>>,
    stall_timeout: std::time::Duration,
) -> Result<BuildOnceResult, BuildOnceError> {
    if let Some((suffix, name, email, message)) = binnmu {
        let suite = build_suite.expect("build_suite required when binnmu is set");
        let tree_root = session.external_path(tree_dir);
        add_dummy_changelog_entry(&tree_root, suffix, suite, message, (name.to_string(), email.to_string()), None)?;
    }
    build_once(session, tree_dir, output_dir, build_command, source_date_epoch, stall_timeout)
}

/// A post-build validator run against the produced artifacts
/// (lintian/piuparts/autopkgtest).
pub trait Validator {
    /// Run this validator inside `session` against `changes_file`,
    /// returning its captured output regardless of outcome.
    fn run(&self, session: &dyn Session, changes_file: &Path) -> Result<(bool, Vec<String>), crate::session::Error>;

    /// Name used in logging/reporting.
    fn name(&self) -> &'static str;
}

/// Runs `lintian` against a `.changes` file.
pub struct Lintian {
    /// Extra arguments to pass (e.g. `["--pedantic"]`).
    pub extra_args: Vec<String>,
}

impl Validator for Lintian {
    fn run(&self, session: &dyn Session, changes_file: &Path) -> Result<(bool, Vec<String>), crate::session::Error> {
        let mut argv = vec!["lintian".to_string()];
        argv.extend(self.extra_args.iter().cloned());
        argv.push(changes_file.to_string_lossy().to_string());
        let (status, lines) = session
            .command(argv.iter().map(String::as_str).collect())
            .run_with_tee()?;
        Ok((status.success(), lines))
    }

    fn name(&self) -> &'static str {
        "lintian"
    }
}

/// Runs `piuparts` against the built `.deb`s.
pub struct Piuparts {
    /// Extra arguments to pass.
    pub extra_args: Vec<String>,
}

impl Validator for Piuparts {
    fn run(&self, session: &dyn Session, changes_file: &Path) -> Result<(bool, Vec<String>), crate::session::Error> {
        let mut argv = vec!["piuparts".to_string()];
        argv.extend(self.extra_args.iter().cloned());
        argv.push(changes_file.to_string_lossy().to_string());
        let (status, lines) = session
            .command(argv.iter().map(String::as_str).collect())
            .user("root")
            .run_with_tee()?;
        Ok((status.success(), lines))
    }

    fn name(&self) -> &'static str {
        "piuparts"
    }
}

/// Runs `autopkgtest` against the built `.deb`s/`.changes`.
pub struct Autopkgtest {
    /// Virtualization server argv, e.g. `["autopkgtest-virt-null"]`.
    pub virt_server: Vec<String>,
}

impl Validator for Autopkgtest {
    fn run(&self, session: &dyn Session, changes_file: &Path) -> Result<(bool, Vec<String>), crate::session::Error> {
        let mut argv = vec!["autopkgtest".to_string(), changes_file.to_string_lossy().to_string(), "--".to_string()];
        argv.extend(self.virt_server.iter().cloned());
        let (status, lines) = session
            .command(argv.iter().map(String::as_str).collect())
            .run_with_tee()?;
        Ok((status.success(), lines))
    }

    fn name(&self) -> &'static str {
        "autopkgtest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_add_suffix_native() {
        assert_eq!(
            "1.0~jan+lint4".parse::<Version>().unwrap(),
            version_add_suffix(&"1.0~jan+lint3".parse().unwrap(), "~jan+lint"),
        );
        assert_eq!(
            "1.0~jan+lint1".parse::<Version>().unwrap(),
            version_add_suffix(&"1.0".parse().unwrap(), "~jan+lint"),
        );
    }

    #[test]
    fn test_version_add_suffix_normal() {
        assert_eq!(
            "1.0-1~jan+lint4".parse::<Version>().unwrap(),
            version_add_suffix(&"1.0-1~jan+lint3".parse().unwrap(), "~jan+lint"),
        );
        assert_eq!(
            "1.0-1~jan+lint1".parse::<Version>().unwrap(),
            version_add_suffix(&"1.0-1".parse().unwrap(), "~jan+lint"),
        );
    }

    #[test]
    fn test_control_files_in_root_true() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("control"), b"").unwrap();
        assert!(control_files_in_root(td.path()));
    }

    #[test]
    fn test_control_files_in_root_false() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir(td.path().join("debian")).unwrap();
        assert!(!control_files_in_root(td.path()));
    }

    #[test]
    fn test_find_changes_files_matches_package_and_version() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("hello_2.10-3_amd64.changes"), b"").unwrap();
        std::fs::write(td.path().join("hello_2.10-3_source.changes"), b"").unwrap();
        std::fs::write(td.path().join("unrelated_1.0-1_amd64.changes"), b"").unwrap();

        let version: Version = "2.10-3".parse().unwrap();
        let mut found = find_changes_files(td.path(), "hello", &version).unwrap();
        found.sort();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|(arch, _)| arch == "amd64"));
        assert!(found.iter().any(|(arch, _)| arch == "source"));
    }

    #[test]
    fn test_add_dummy_changelog_entry() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(
            td.path().join("debian_changelog_test_unused"),
            "",
        )
        .unwrap();
        std::fs::create_dir(td.path().join("debian")).unwrap();
        std::fs::write(
            td.path().join("debian/changelog"),
            "hello (2.10-3) unstable; urgency=medium\n\n  * Initial release.\n\n -- Maintainer <m@example.com>  Sat, 05 Sep 2020 12:35:04 -0000\n",
        )
        .unwrap();

        let version = add_dummy_changelog_entry(
            td.path(),
            "+b",
            "unstable",
            "Binary rebuild.",
            ("Buildd".to_string(), "buildd@example.com".to_string()),
            Some(chrono::DateTime::parse_from_rfc3339("2020-09-05T12:35:04Z").unwrap().to_utc()),
        )
        .unwrap();
        assert_eq!(version.to_string(), "2.10-3+b1");
    }
}
