//! Linux user-namespace backend.
//!
//! Every command runs under `unshare --map-users=auto --map-groups=auto
//! --fork --pid --mount-proc --net --uts --ipc --root <root>`, giving each
//! build its own private filesystem, PID namespace, and network namespace
//! without requiring root on the host (setuid `newuidmap`/`newgidmap`
//! helpers do the UID/GID mapping).

use super::{CommandBuilder, Error, ImageError, Project, Session};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An unshare-based session, rooted at an extracted tarball or a freshly
/// bootstrapped minbase tree.
pub struct UnshareSession {
    root: PathBuf,
    _tempdir: Option<tempfile::TempDir>,
    cwd: PathBuf,
    /// Path to repack this session's tree into on teardown ("source"
    /// mode: the session was extracted from a cache tarball that should
    /// stay current), or `None` for a one-off bootstrap with nothing to
    /// repack into.
    source_tarball: Option<PathBuf>,
}

fn compression_flag(path: &Path) -> Result<Option<&str>, Error> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("tar") => Ok(None),
        Some("gz") => Ok(Some("-z")),
        Some("bz2") => Ok(Some("-j")),
        Some("xz") => Ok(Some("-J")),
        Some("zst") => Ok(Some("--zstd")),
        other => Err(Error::SetupFailure(
            "unknown extension".to_string(),
            format!("unknown extension: {:?}", other),
        )),
    }
}

fn arch_name() -> Result<&'static str, Error> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        other => Err(Error::ImageError(ImageError::UnsupportedArchitecture {
            arch: other.to_string(),
        })),
    }
}

impl UnshareSession {
    /// Create a session from a cached Debian cloud image tarball, under
    /// `~/.cache/ipbo/images/debian-{suite}-{arch}.tar.xz`.
    pub fn cached_debian_session(suite: &str, allow_bootstrap: bool) -> Result<Self, Error> {
        let arch_name = arch_name()?;

        let cache_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::SetupFailure(
                    "cannot determine cache directory".to_string(),
                    "HOME is not set".to_string(),
                )
            })?
            .join(".cache")
            .join("ipbo")
            .join("images");

        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| Error::SetupFailure("failed to create cache dir".to_string(), e.to_string()))?;

        let tarball_name = format!("debian-{}-{}.tar.xz", suite, arch_name);
        let tarball_path = cache_dir.join(&tarball_name);

        if !tarball_path.exists() {
            if !allow_bootstrap {
                return Err(Error::ImageError(ImageError::CachedImageNotFound {
                    path: tarball_path,
                }));
            }
            log::info!("no cached Debian {} image, bootstrapping with mmdebstrap", suite);
            return bootstrap_debian_tarball(suite);
        }

        log::info!("using cached Debian {} image from {}", suite, tarball_path.display());
        Self::from_tarball(&tarball_path)
    }

    /// Extract a tarball into a fresh temporary root.
    pub fn from_tarball(path: &Path) -> Result<Self, Error> {
        let td = tempfile::tempdir()
            .map_err(|e| Error::SetupFailure("tempdir failed".to_string(), e.to_string()))?;
        let root = td.path();

        let f = std::fs::File::open(path)
            .map_err(|e| Error::SetupFailure("open failed".to_string(), e.to_string()))?;

        for dir in &["proc", "sys", "dev"] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| {
                Error::SetupFailure(format!("failed to create {} directory", dir), e.to_string())
            })?;
        }

        let output = std::process::Command::new("unshare")
            .arg("--map-users=auto")
            .arg("--map-groups=auto")
            .arg("--fork")
            .arg("--pid")
            .arg("--mount-proc")
            .arg("--net")
            .arg("--uts")
            .arg("--ipc")
            .arg("--wd")
            .arg(root)
            .arg("--")
            .arg("tar")
            .arg("x")
            .arg(compression_flag(path)?.unwrap_or("--"))
            .stdin(std::process::Stdio::from(f))
            .stderr(std::process::Stdio::piped())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Error::SetupFailure("tar failed".to_string(), stderr));
        }

        let s = Self {
            root: root.to_path_buf(),
            _tempdir: Some(td),
            cwd: PathBuf::from("/"),
            source_tarball: Some(path.to_path_buf()),
        };
        s.ensure_current_user()?;
        Ok(s)
    }

    /// Dump the session's filesystem to a tarball, from inside the session
    /// so file ownership is preserved.
    pub fn save_to_tarball(&self, path: &Path) -> Result<(), Error> {
        let mut child = self.popen(
            vec![
                "tar",
                "c",
                "--absolute-names",
                "--exclude",
                "/dev/*",
                "--exclude",
                "/proc/*",
                "--exclude",
                "/sys/*",
                compression_flag(path)?.unwrap_or("--"),
                "/",
            ],
            Some(Path::new("/")),
            Some("root"),
            Some(std::process::Stdio::piped()),
            None,
            None,
            None,
        )?;

        let f = std::fs::File::create(path)
            .map_err(|e| Error::SetupFailure("create failed".to_string(), e.to_string()))?;
        let mut writer = std::io::BufWriter::new(f);
        std::io::copy(child.stdout.as_mut().unwrap(), &mut writer)
            .map_err(|e| Error::SetupFailure("copy failed".to_string(), e.to_string()))?;

        if child.wait()?.success() {
            Ok(())
        } else {
            Err(Error::SetupFailure("tar failed".to_string(), "tar exited non-zero".to_string()))
        }
    }

    /// Bootstrap a fresh Debian sid root using `mmdebstrap`.
    pub fn bootstrap() -> Result<Self, Error> {
        bootstrap_debian_tarball("sid")
    }

    /// Ensure the invoking host user has a matching uid/gid account inside
    /// the session, so ownership of files staged from the host resolves
    /// sensibly.
    pub fn ensure_current_user(&self) -> Result<(), Error> {
        let user = whoami::username();
        let uid = nix::unistd::getuid().to_string();
        let gid = nix::unistd::getgid().to_string();

        self.check_call(
            vec![
                "/usr/sbin/groupadd",
                "--force",
                "--non-unique",
                "--gid",
                &gid,
                user.as_str(),
            ],
            Some(Path::new("/")),
            Some("root"),
            None,
        )?;

        let child = self.popen(
            vec!["/usr/sbin/useradd", "--uid", &uid, "--gid", &gid, user.as_str()],
            Some(Path::new("/")),
            Some("root"),
            Some(std::process::Stdio::piped()),
            None,
            None,
            None,
        )?;

        let output = child.wait_with_output()?;
        match output.status.code() {
            // 0: created. 9: group exists. 4: uid already in use - both
            // are fine, the account is already usable.
            Some(0) | Some(9) | Some(4) => Ok(()),
            _ => Err(Error::SetupFailure(
                "useradd failed".to_string(),
                String::from_utf8_lossy(&output.stdout).to_string(),
            )),
        }
    }

    /// Build the full `unshare ... -- argv` invocation for running `argv`
    /// as `user` in `cwd`.
    pub fn run_argv<'a>(
        &'a self,
        argv: Vec<&'a str>,
        cwd: Option<&'a Path>,
        user: Option<&'a str>,
    ) -> Vec<&'a str> {
        let mut ret = vec![
            "unshare",
            "--map-users=auto",
            "--map-groups=auto",
            "--fork",
            "--pid",
            "--mount-proc",
            "--net",
            "--uts",
            "--ipc",
            "--root",
            self.root.to_str().unwrap(),
            "--wd",
            cwd.unwrap_or(&self.cwd).to_str().unwrap(),
        ];
        if let Some(user) = user {
            if user == "root" {
                ret.push("--map-root-user");
            } else {
                ret.push("--map-user");
                ret.push(user);
            }
        } else {
            ret.push("--map-current-user");
        }
        ret.push("--");
        ret.extend(argv);
        ret
    }

    fn build_tempdir(&self, user: Option<&str>) -> PathBuf {
        let build_dir = "/build";
        self.check_call(vec!["mkdir", "-p", build_dir], None, user, None)
            .unwrap();
        String::from_utf8(
            self.check_output(
                vec!["mktemp", "-d", format!("--tmpdir={}", build_dir).as_str()],
                Some(Path::new("/")),
                user,
                None,
            )
            .unwrap(),
        )
        .unwrap()
        .trim_end_matches('\n')
        .to_string()
        .into()
    }
}

/// Bootstrap a fresh Debian suite root with `mmdebstrap`.
pub fn bootstrap_debian_tarball(suite: &str) -> Result<UnshareSession, Error> {
    let td = tempfile::tempdir()
        .map_err(|e| Error::SetupFailure("tempdir failed".to_string(), e.to_string()))?;
    let root = td.path();

    let status = std::process::Command::new("mmdebstrap")
        .current_dir(root)
        .arg("--mode=unshare")
        .arg("--variant=minbase")
        .arg("--quiet")
        .arg(suite)
        .arg(root)
        .arg("http://deb.debian.org/debian/")
        .status()
        .map_err(|e| {
            Error::SetupFailure(
                "mmdebstrap command not found or failed to execute".to_string(),
                format!("failed to run mmdebstrap (ensure it's installed): {}", e),
            )
        })?;

    if !status.success() {
        return Err(Error::SetupFailure(
            "mmdebstrap failed".to_string(),
            format!(
                "mmdebstrap exited with status: {}. This likely requires network access to http://deb.debian.org/debian/",
                status
            ),
        ));
    }

    let s = UnshareSession {
        root: root.to_path_buf(),
        _tempdir: Some(td),
        cwd: PathBuf::from("/"),
        source_tarball: None,
    };
    s.ensure_current_user()?;
    Ok(s)
}

/// Create a Debian test session, preferring (in order) an explicit tarball
/// path, a cached cloud image, or a fresh `mmdebstrap` bootstrap.
pub fn create_debian_session_for_testing(suite: &str) -> Result<UnshareSession, Error> {
    if let Ok(tarball_path) = std::env::var("IPBO_DEBIAN_TEST_TARBALL") {
        let path = Path::new(&tarball_path);
        if path.exists() {
            return UnshareSession::from_tarball(path);
        }
        return Err(Error::SetupFailure(
            "tarball not found".to_string(),
            format!("IPBO_DEBIAN_TEST_TARBALL points to non-existent file: {}", tarball_path),
        ));
    }

    if std::env::var("IPBO_USE_DEBIAN_CLOUD_IMAGE").is_ok() {
        return UnshareSession::cached_debian_session(suite, true);
    }

    bootstrap_debian_tarball(suite)
}

impl UnshareSession {
    /// Tear down the session: if it was extracted from a tarball whose
    /// path should stay current ("source" mode), repack the tree back
    /// into that path first, then clear the root from inside the
    /// namespace (where the mapped uids/gids that `--map-users=auto`
    /// created are removable) rather than leaving that to
    /// `tempfile::TempDir`'s own drop, which runs `remove_dir_all` from
    /// outside the namespace and silently leaves behind anything it
    /// can't unlink across the uid mapping.
    pub fn end(self) -> Result<(), Error> {
        drop(self);
        Ok(())
    }
}

impl Drop for UnshareSession {
    fn drop(&mut self) {
        if let Some(tarball) = self.source_tarball.clone() {
            if let Err(e) = self.save_to_tarball(&tarball) {
                log::warn!("failed to repack session into {}: {}", tarball.display(), e);
            }
        }
        if let Err(e) = self.check_call(
            vec!["rm", "-rf", "--one-file-system", "/"],
            Some(Path::new("/")),
            Some("root"),
            None,
        ) {
            log::warn!("failed to clear session root {} before teardown: {}", self.root.display(), e);
        }
    }
}

impl Session for UnshareSession {
    fn chdir(&mut self, path: &Path) -> Result<(), Error> {
        self.cwd = self.cwd.join(path);
        Ok(())
    }

    fn pwd(&self) -> &Path {
        &self.cwd
    }

    fn external_path(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("/") {
            return self.location().join(rest);
        }
        self.location()
            .join(self.cwd.to_string_lossy().to_string().trim_start_matches('/'))
            .join(path)
    }

    fn location(&self) -> PathBuf {
        self.root.clone()
    }

    fn check_output(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Vec<u8>, Error> {
        let argv = self.run_argv(argv, cwd, user);
        let output = std::process::Command::new(argv[0])
            .args(&argv[1..])
            .stderr(std::process::Stdio::inherit())
            .envs(env.unwrap_or_default())
            .output();

        match output {
            Ok(output) if output.status.success() => Ok(output.stdout),
            Ok(output) => Err(Error::CalledProcessError(output.status)),
            Err(e) => Err(Error::IoError(e)),
        }
    }

    fn create_home(&self) -> Result<(), Error> {
        super::create_home(self)
    }

    fn check_call(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<(), Error> {
        let argv = self.run_argv(argv, cwd, user);
        let status = std::process::Command::new(argv[0])
            .args(&argv[1..])
            .envs(env.unwrap_or_default())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::CalledProcessError(status)),
            Err(e) => Err(Error::IoError(e)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.check_call(vec!["test", "-e", path.to_str().unwrap()], None, None, None)
            .is_ok()
    }

    fn mkdir(&self, path: &Path) -> Result<(), Error> {
        self.check_call(vec!["mkdir", path.to_str().unwrap()], None, None, None)
    }

    fn rmtree(&self, path: &Path) -> Result<(), Error> {
        self.check_call(vec!["rm", "-rf", path.to_str().unwrap()], None, None, None)
    }

    fn project_from_directory(&self, path: &Path, subdir: Option<&str>) -> Result<Project, Error> {
        let subdir = subdir.unwrap_or("package");
        let reldir = self.build_tempdir(Some("root"));
        let export_directory = self.external_path(&reldir).join(subdir);

        let mut options = fs_extra::dir::CopyOptions::new();
        options.copy_inside = true;
        options.content_only = false;
        options.skip_exist = false;
        options.overwrite = true;
        options.buffer_size = 64000;
        options.depth = 0;

        fs_extra::dir::copy(path, &export_directory, &options)
            .map_err(|e| Error::SetupFailure("copy failed".to_string(), e.to_string()))?;

        Ok(Project::Temporary {
            external_path: export_directory,
            internal_path: reldir.join(subdir),
            td: self.external_path(&reldir),
        })
    }

    fn popen(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        stdout: Option<std::process::Stdio>,
        stderr: Option<std::process::Stdio>,
        stdin: Option<std::process::Stdio>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<std::process::Child, Error> {
        let argv = self.run_argv(argv, cwd, user);
        let mut cmd = std::process::Command::new(argv[0]);
        cmd.args(&argv[1..]);

        if let Some(env) = env {
            cmd.envs(env);
        }
        if let Some(stdin) = stdin {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = stderr {
            cmd.stderr(stderr);
        }
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        Ok(cmd.spawn()?)
    }

    fn is_temporary(&self) -> bool {
        true
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<std::fs::DirEntry>, Error> {
        std::fs::read_dir(self.external_path(path))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::IoError)
    }

    fn command<'a>(&'a self, argv: Vec<&'a str>) -> CommandBuilder<'a> {
        CommandBuilder::new(self, argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static::lazy_static! {
        static ref TEST_SESSION: std::sync::Mutex<UnshareSession> = std::sync::Mutex::new(
            create_debian_session_for_testing("sid")
                .expect("failed to create test session; requires network access.\nAvoid this by setting IPBO_DEBIAN_TEST_TARBALL=/path/to/tarball.tar.xz or IPBO_USE_DEBIAN_CLOUD_IMAGE=1")
        );
    }

    fn test_session() -> Option<std::sync::MutexGuard<'static, UnshareSession>> {
        if std::env::var("GITHUB_ACTIONS").is_ok() {
            return None;
        }
        match TEST_SESSION.lock() {
            Ok(guard) => Some(guard),
            Err(poisoned) => Some(poisoned.into_inner()),
        }
    }

    #[test]
    fn test_is_temporary() {
        let session = match test_session() {
            Some(s) => s,
            None => return,
        };
        assert!(session.is_temporary());
    }

    #[test]
    fn test_chdir() {
        let mut session = match test_session() {
            Some(s) => s,
            None => return,
        };
        session.chdir(Path::new("/")).unwrap();
    }

    #[test]
    fn test_check_call() {
        let session = match test_session() {
            Some(s) => s,
            None => return,
        };
        session.check_call(vec!["true"], Some(Path::new("/")), None, None).unwrap();
    }

    #[test]
    fn test_mkdir_rmdir() {
        let session = match test_session() {
            Some(s) => s,
            None => return,
        };
        let path = Path::new("/tmp/test");
        session.mkdir(path).unwrap();
        assert!(session.exists(path));
        session.rmtree(path).unwrap();
        assert!(!session.exists(path));
    }

    #[test]
    fn test_external_path() {
        let mut session = match test_session() {
            Some(s) => s,
            None => return,
        };
        let path = Path::new("/tmp/test");
        assert_eq!(session.external_path(path), session.location().join("tmp/test"));
        session.chdir(Path::new("/tmp")).unwrap();
        let path = Path::new("test");
        assert_eq!(session.external_path(path), session.location().join("tmp/test"));
    }

    #[test]
    fn test_cached_debian_session_no_download() {
        let result = UnshareSession::cached_debian_session("test-suite-nonexistent", false);
        assert!(result.is_err());
        if let Err(err) = result {
            assert!(matches!(err, Error::ImageError(ImageError::CachedImageNotFound { .. })));
        }
    }

    #[test]
    fn test_from_tarball_records_source_path_for_repack() {
        // Without a real unshare-capable environment this can't actually
        // extract, but it documents the field `from_tarball` is required
        // to populate so `Drop` knows where to repack to.
        let path = Path::new("/nonexistent/debian-sid-amd64.tar.xz");
        let result = UnshareSession::from_tarball(path);
        assert!(result.is_err());
    }
}
