//! Dependency Resolver: drives `apt` inside a session to satisfy the
//! build/core dependencies computed from the ephemeral repo's dummy
//! package, and records everything it installs in a Change Ledger so it
//! can be undone afterwards.
//!
//! Generalizes `debian::apt::AptManager`/`run_apt` into the resolver
//! described by the spec: add-architecture, update/upgrade/dist-upgrade/
//! clean/autoclean/autoremove, install core/main deps, uninstall-by-ledger,
//! and purge-extra-packages.

use crate::relations::DependencyRecord;
use crate::session::Session;

/// Errors raised while resolving or applying dependencies via apt.
#[derive(Debug)]
pub enum Error {
    /// `apt` exited non-zero and buildlog-consultant attributed a specific
    /// cause to the failure.
    Detailed {
        /// The arguments `apt` was invoked with.
        args: Vec<String>,
        /// The diagnosed problem.
        error: Box<dyn buildlog_consultant::Problem>,
    },
    /// `apt` exited non-zero and no specific cause could be attributed.
    Unidentified {
        /// The arguments `apt` was invoked with.
        args: Vec<String>,
        /// The captured output lines.
        lines: Vec<String>,
    },
    /// An error occurred running a command in the session.
    Session(crate::session::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Detailed { args, error } => {
                write!(f, "apt {:?} failed: {}", args, error)
            }
            Error::Unidentified { args, lines } => {
                write!(f, "apt {:?} failed:\n{}", args, lines.join("\n"))
            }
            Error::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::session::Error> for Error {
    fn from(e: crate::session::Error) -> Self {
        Error::Session(e)
    }
}

/// Which tool (if any) explains WHY a dependency set is uninstallable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Explainer {
    /// Don't attempt to explain, just report the raw apt failure.
    Off,
    /// Run `apt-get --dry-run` and surface its would-be actions.
    AptDryRun,
    /// Run `dose3`'s `dose-debcheck` for a formal unsatisfiability proof.
    Dose3,
}

/// Every package apt installed on behalf of a build, in installation
/// order, so it can be removed again afterwards (spec's Change Ledger).
#[derive(Debug, Default, Clone)]
pub struct ChangeLedger {
    installed: Vec<String>,
}

impl ChangeLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        ChangeLedger::default()
    }

    /// Record that `package` was installed.
    pub fn record(&mut self, package: &str) {
        self.installed.push(package.to_string());
    }

    /// The packages recorded so far, in installation order.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    /// The packages to remove to undo this ledger, in reverse
    /// installation order.
    pub fn removal_order(&self) -> Vec<String> {
        let mut v = self.installed.clone();
        v.reverse();
        v
    }
}

/// The fixed `apt`/`dpkg` option set applied to every invocation this
/// resolver makes: conservative conffile handling (never prompt, never
/// silently keep a stale conffile), purge-on-remove, no recommends, and no
/// pseudo-tty (so apt never tries to draw a progress bar into the
/// tee'd/logged output).
const FIXED_APT_OPTIONS: &[&str] = &[
    "-o",
    "Dpkg::Options::=--force-confold",
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "APT::Get::Purge=true",
    "-o",
    "APT::Install-Recommends=false",
    "-o",
    "Dpkg::Use-Pty=0",
];

/// Drives `apt` inside a session to satisfy dependencies, tracking what it
/// installs in a [`ChangeLedger`].
pub struct AptResolver<'a> {
    session: &'a dyn Session,
    prefix: Vec<String>,
    explainer: Explainer,
    ledger: ChangeLedger,
}

impl<'a> AptResolver<'a> {
    /// Create a resolver, adding `sudo` to the command prefix unless the
    /// session is already running as root.
    pub fn from_session(session: &'a dyn Session, explainer: Explainer) -> Self {
        let prefix = if crate::session::get_user(session) != "root" {
            vec!["sudo".to_string()]
        } else {
            vec![]
        };
        AptResolver {
            session,
            prefix,
            explainer,
            ledger: ChangeLedger::new(),
        }
    }

    /// The ledger of everything installed through this resolver so far.
    pub fn ledger(&self) -> &ChangeLedger {
        &self.ledger
    }

    fn run_apt(&self, args: Vec<&str>) -> Result<(), Error> {
        run_apt(self.session, args, self.prefix.iter().map(String::as_str).collect())
    }

    /// `dpkg --add-architecture` + `apt update`, for cross-architecture
    /// builds that need foreign-arch packages.
    pub fn add_foreign_architecture(&self, arch: &str) -> Result<(), Error> {
        self.session
            .command(
                self.prefix
                    .iter()
                    .map(String::as_str)
                    .chain(["dpkg", "--add-architecture", arch])
                    .collect(),
            )
            .check_call()?;
        self.update()
    }

    /// Refresh the package index, picking up the ephemeral repository.
    pub fn update(&self) -> Result<(), Error> {
        self.run_apt(vec!["update"])
    }

    /// `apt upgrade`: bring already-installed packages up to the index's
    /// latest version without adding or removing packages.
    pub fn upgrade(&self) -> Result<(), Error> {
        self.run_apt(vec!["upgrade"])
    }

    /// `apt dist-upgrade`: like [`AptResolver::upgrade`], but allowed to
    /// add/remove packages to satisfy a new dependency graph.
    pub fn dist_upgrade(&self) -> Result<(), Error> {
        self.run_apt(vec!["dist-upgrade"])
    }

    /// `apt clean`: delete every cached `.deb` apt has downloaded.
    pub fn clean(&self) -> Result<(), Error> {
        self.run_apt(vec!["clean"])
    }

    /// `apt autoclean`: delete only cached `.deb`s that can no longer be
    /// downloaded (superseded versions), keeping ones still current.
    pub fn autoclean(&self) -> Result<(), Error> {
        self.run_apt(vec!["autoclean"])
    }

    /// `apt autoremove`: drop automatically-installed packages no longer
    /// depended on by anything still installed.
    pub fn autoremove(&self) -> Result<(), Error> {
        self.run_apt(vec!["autoremove"])
    }

    /// Install the core toolchain packages (`build-essential`,
    /// `fakeroot`, ...) that every build needs regardless of the source
    /// package's own `Build-Depends`.
    pub fn install_core_deps(&mut self, packages: &[&str]) -> Result<(), Error> {
        self.run_apt(["install"].into_iter().chain(packages.iter().copied()).collect())?;
        for p in packages {
            self.ledger.record(p);
        }
        Ok(())
    }

    /// Install the reduced `Build-Depends`/`Build-Depends-Arch`/
    /// `Build-Depends-Indep` set via the dummy meta-package built by the
    /// ephemeral repo builder.
    pub fn install_main_deps(&mut self, meta_package: &str) -> Result<(), Error> {
        self.run_apt(vec!["install", meta_package])?;
        self.ledger.record(meta_package);
        Ok(())
    }

    /// Use `apt satisfy` to install an arbitrary relation field directly,
    /// without going through a meta-package (used for hook-requested
    /// extra packages).
    pub fn satisfy(&mut self, dep: &DependencyRecord) -> Result<(), Error> {
        self.run_apt(vec!["satisfy", &dep.to_string()])?;
        for name in dep.package_names() {
            self.ledger.record(&name);
        }
        Ok(())
    }

    /// Remove everything this resolver installed, in reverse order.
    pub fn uninstall_deps(&self) -> Result<(), Error> {
        let removal = self.ledger.removal_order();
        if removal.is_empty() {
            return Ok(());
        }
        self.run_apt(
            ["remove", "--purge"]
                .into_iter()
                .chain(removal.iter().map(String::as_str))
                .collect(),
        )
    }

    /// Temporarily downgrade `packages`' recorded `Priority:` in
    /// `/var/lib/dpkg/status` from `required`/`important` to `optional`,
    /// so a subsequent `autoremove --allow-remove-essential` is actually
    /// willing to consider them. The original file is backed up first and
    /// restored by [`AptResolver::restore_dpkg_status_priority`].
    fn lower_dpkg_status_priority(&self, packages: &[String]) -> Result<(), Error> {
        if packages.is_empty() {
            return Ok(());
        }
        self.session
            .command(vec!["cp", "-a", "/var/lib/dpkg/status", "/var/lib/dpkg/status.ipbo-orig"])
            .user("root")
            .check_call()?;
        for pkg in packages {
            let script = format!(
                "awk -v RS= -v ORS='\\n\\n' '$0 ~ /^Package: {pkg}$/ {{ gsub(/Priority: (required|important)/, \"Priority: optional\") }} {{ print }}' /var/lib/dpkg/status > /var/lib/dpkg/status.ipbo-tmp && mv /var/lib/dpkg/status.ipbo-tmp /var/lib/dpkg/status",
                pkg = pkg
            );
            self.session.command(vec!["sh", "-c", &script]).user("root").check_call()?;
        }
        Ok(())
    }

    /// Restore `/var/lib/dpkg/status` from the backup
    /// [`AptResolver::lower_dpkg_status_priority`] made, if any.
    fn restore_dpkg_status_priority(&self) -> Result<(), Error> {
        self.session
            .command(vec![
                "sh",
                "-c",
                "[ -f /var/lib/dpkg/status.ipbo-orig ] && mv /var/lib/dpkg/status.ipbo-orig /var/lib/dpkg/status || true",
            ])
            .user("root")
            .check_call()
    }

    /// Purge packages that were present in the base chroot but are not
    /// needed for this build, using `dpkg-query`'s priority field to find
    /// candidates, then the same `Priority:` rewrite plus mark-auto plus
    /// `autoremove --allow-remove-essential` sequence sbuild-style build
    /// environments use to strip a minbase image down further than a
    /// plain `apt remove` is willing to go.
    ///
    /// Lines from `dpkg-query` that don't parse into the expected
    /// `package\tpriority` shape are skipped with a warning rather than
    /// aborting the whole purge, matching how `run_apt` itself treats
    /// unparsable subprocess output as non-fatal.
    pub fn purge_extra_packages(&self, keep: &[&str]) -> Result<(), Error> {
        let output = self
            .session
            .command(vec!["dpkg-query", "-W", "-f=${Package}\t${Priority}\n"])
            .check_output()
            .map_err(Error::Session)?;
        let text = String::from_utf8_lossy(&output);

        let mut extra = Vec::new();
        for line in text.lines() {
            let mut parts = line.splitn(2, '\t');
            let (package, priority) = match (parts.next(), parts.next()) {
                (Some(p), Some(pr)) => (p, pr),
                _ => {
                    log::warn!("unexpected dpkg-query output line, skipping: {:?}", line);
                    continue;
                }
            };
            if keep.contains(&package) {
                continue;
            }
            if priority == "required" || priority == "important" {
                extra.push(package.to_string());
            }
        }

        if extra.is_empty() {
            return Ok(());
        }

        self.lower_dpkg_status_priority(&extra)?;
        let mark_result = self.run_apt(["mark", "auto"].into_iter().chain(extra.iter().map(String::as_str)).collect());
        let purge_result = mark_result.and_then(|()| self.run_apt(vec!["autoremove", "--allow-remove-essential"]));
        let restore_result = self.restore_dpkg_status_priority();
        purge_result?;
        restore_result.map_err(Error::Session)
    }

    /// Ask the configured explainer why a relation field cannot be
    /// satisfied. Returns a human-readable explanation, or `None` if the
    /// explainer is `Off` or produced nothing. `dose-debcheck` exit codes
    /// `>= 64` are a hard error (malformed input or an internal dose3
    /// failure, not "unsatisfiable") and are propagated rather than
    /// silently treated as "no explanation available".
    pub fn explain_unsatisfiable(&self, dep: &DependencyRecord) -> Result<Option<String>, Error> {
        match self.explainer {
            Explainer::Off => Ok(None),
            Explainer::AptDryRun => {
                let out = self
                    .session
                    .command(vec!["apt-get", "--dry-run", "satisfy", &dep.to_string()])
                    .check_output()?;
                Ok(Some(String::from_utf8_lossy(&out).to_string()))
            }
            Explainer::Dose3 => {
                let (status, lines) = self
                    .session
                    .command(vec!["dose-debcheck", "--explain", &dep.to_string()])
                    .run_with_tee()?;
                let code = status.code().unwrap_or(0);
                if code >= 64 {
                    return Err(Error::Unidentified {
                        args: vec!["dose-debcheck".to_string(), "--explain".to_string(), dep.to_string()],
                        lines,
                    });
                }
                Ok(Some(lines.join("\n")))
            }
        }
    }
}

/// Run `apt <FIXED_APT_OPTIONS> -y <args>` with the given prefix (e.g.
/// `sudo`) under a non-interactive frontend, returning a diagnosed error
/// via `buildlog-consultant` on failure.
pub fn run_apt(session: &dyn Session, args: Vec<&str>, prefix: Vec<&str>) -> Result<(), Error> {
    let full: Vec<&str> = prefix
        .into_iter()
        .chain(["apt", "-y"])
        .chain(FIXED_APT_OPTIONS.iter().copied())
        .chain(args)
        .collect();
    log::info!("apt: running {:?}", full);
    let mut env = std::collections::HashMap::new();
    env.insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());
    let (status, mut lines) = session
        .command(full.clone())
        .cwd(std::path::Path::new("/"))
        .user("root")
        .env(env)
        .run_with_tee()?;
    if status.success() {
        return Ok(());
    }

    let (_m, error) =
        buildlog_consultant::apt::find_apt_get_failure(lines.iter().map(String::as_str).collect());
    if let Some(error) = error {
        return Err(Error::Detailed {
            args: full.iter().map(|s| s.to_string()).collect(),
            error,
        });
    }
    while lines.last().map_or(false, |l| l.trim().is_empty()) {
        lines.pop();
    }
    Err(Error::Unidentified {
        args: full.iter().map(|s| s.to_string()).collect(),
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_ledger_removal_order() {
        let mut ledger = ChangeLedger::new();
        ledger.record("a");
        ledger.record("b");
        ledger.record("c");
        assert_eq!(ledger.removal_order(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_change_ledger_empty() {
        let ledger = ChangeLedger::new();
        assert!(ledger.removal_order().is_empty());
    }

    #[test]
    fn test_fixed_apt_options_disable_recommends_and_pty() {
        assert!(FIXED_APT_OPTIONS.contains(&"APT::Install-Recommends=false"));
        assert!(FIXED_APT_OPTIONS.contains(&"Dpkg::Use-Pty=0"));
    }
}
