//! Session handling for isolated build environments.
//!
//! A [`Session`] is a handle onto one ephemeral or persistent filesystem
//! tree (a chroot, an unshare root, or the bare host) plus the means to run
//! commands inside it. The three backends (direct chroot, external chroot
//! manager, unshare) all implement the same trait so the rest of the crate
//! never has to special-case which one is in use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Direct-chroot backend (privileged launcher, no external manager).
pub mod direct;
/// External chroot manager backend speaking the line-oriented wire protocol.
pub mod external;
/// Linux user-namespace (`unshare`) backend.
pub mod unshare;

/// Errors that can occur while driving a session.
#[derive(Debug)]
pub enum Error {
    /// A subprocess exited with a non-zero status.
    CalledProcessError(std::process::ExitStatus),
    /// An I/O error occurred while spawning or communicating with a process.
    IoError(std::io::Error),
    /// Session setup (bootstrap, mount, extraction, ...) failed.
    SetupFailure(String, String),
    /// Something went wrong fetching or unpacking a filesystem image.
    ImageError(ImageError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CalledProcessError(status) => write!(f, "command failed: {}", status),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::SetupFailure(summary, detail) => {
                write!(f, "session setup failed: {}: {}", summary, detail)
            }
            Error::ImageError(e) => write!(f, "image error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Errors specific to fetching/unpacking a base filesystem image.
#[derive(Debug)]
pub enum ImageError {
    /// The host/target architecture has no known image mapping.
    UnsupportedArchitecture {
        /// The `std::env::consts::ARCH`-style architecture name.
        arch: String,
    },
    /// No cached image was found and downloading was not requested.
    CachedImageNotFound {
        /// The path that was checked for a cached tarball.
        path: PathBuf,
    },
    /// Downloading an image is not available in this build.
    DownloadNotAvailable {
        /// Human-readable explanation.
        reason: String,
    },
    /// Downloading an image failed.
    DownloadFailed {
        /// The URL that was requested.
        url: String,
        /// The underlying error.
        error: String,
    },
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImageError::UnsupportedArchitecture { arch } => {
                write!(f, "unsupported architecture: {}", arch)
            }
            ImageError::CachedImageNotFound { path } => {
                write!(f, "no cached image at {}", path.display())
            }
            ImageError::DownloadNotAvailable { reason } => write!(f, "{}", reason),
            ImageError::DownloadFailed { url, error } => {
                write!(f, "failed to download {}: {}", url, error)
            }
        }
    }
}

impl std::error::Error for ImageError {}

/// A project tree made visible inside a session.
///
/// `Temporary` trees are cleaned up (by removing `internal_path`) when no
/// longer needed; sessions that operate directly on the host may hand back
/// a tree that is not temporary at all.
pub enum Project {
    /// A tree that was copied/exported into a temporary location for the
    /// duration of the build.
    Temporary {
        /// Path to the tree as seen from outside the session.
        external_path: PathBuf,
        /// Path to the tree as seen from inside the session.
        internal_path: PathBuf,
        /// The temporary directory backing `external_path`, kept alive
        /// for as long as the `Project` is alive.
        td: PathBuf,
    },
}

impl Project {
    /// Path to the tree as seen from outside the session.
    pub fn external_path(&self) -> &Path {
        match self {
            Project::Temporary { external_path, .. } => external_path,
        }
    }

    /// Path to the tree as seen from inside the session.
    pub fn internal_path(&self) -> &Path {
        match self {
            Project::Temporary { internal_path, .. } => internal_path,
        }
    }
}

/// Allow-listed environment variables are the only host environment that
/// crosses into a session unless explicitly passed through `env`.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    /// Regular expressions matched against variable names.
    allow: Vec<regex::Regex>,
}

impl EnvPolicy {
    /// An empty policy: no host environment variables are forwarded.
    pub fn empty() -> Self {
        EnvPolicy { allow: Vec::new() }
    }

    /// Add an allow-list pattern.
    pub fn allow(mut self, pattern: &str) -> Self {
        self.allow
            .push(regex::Regex::new(pattern).expect("invalid env allow-list pattern"));
        self
    }

    /// Compose the environment that should be passed to a command: the
    /// allow-listed subset of the host environment, overridden by `extra`.
    pub fn compose(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for (k, v) in std::env::vars() {
            if self.allow.iter().any(|re| re.is_match(&k)) {
                env.insert(k, v);
            }
        }
        for (k, v) in extra {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// Everything needed to launch one command: the argv, the user and
/// directory to run it as/in, the environment, and where its output goes.
pub struct ExecutionContext<'a> {
    /// The command and its arguments.
    pub argv: Vec<&'a str>,
    /// User to run the command as, `None` for the session's default user.
    pub user: Option<&'a str>,
    /// Working directory, `None` for the session's current directory.
    pub cwd: Option<&'a Path>,
    /// Explicit environment variables, composed on top of any allow-listed
    /// host variables.
    pub env: Option<HashMap<String, String>>,
    /// Whether this process should become the leader of its own process
    /// group, so the whole group can be signalled by the stall watchdog.
    pub session_leader: bool,
    /// Scheduling priority (`nice` value), if the backend supports one.
    pub priority: Option<i32>,
}

impl<'a> ExecutionContext<'a> {
    /// Start building an execution context for the given argv.
    pub fn new(argv: Vec<&'a str>) -> Self {
        ExecutionContext {
            argv,
            user: None,
            cwd: None,
            env: None,
            session_leader: false,
            priority: None,
        }
    }

    /// Run as the given user.
    pub fn user(mut self, user: &'a str) -> Self {
        self.user = Some(user);
        self
    }

    /// Run in the given working directory.
    pub fn cwd(mut self, cwd: &'a Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Set explicit environment variables.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Make the spawned process the leader of a new process group.
    pub fn session_leader(mut self, leader: bool) -> Self {
        self.session_leader = leader;
        self
    }

    /// Set a `nice`-style scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Fluent builder over [`Session::popen`]/[`Session::check_output`], mirroring
/// how the rest of the crate invokes commands inside a session.
pub struct CommandBuilder<'a> {
    session: &'a dyn Session,
    argv: Vec<&'a str>,
    cwd: Option<&'a Path>,
    user: Option<&'a str>,
    env: Option<HashMap<String, String>>,
}

impl<'a> CommandBuilder<'a> {
    /// Start a new command builder for the given session and argv.
    pub fn new(session: &'a dyn Session, argv: Vec<&'a str>) -> Self {
        CommandBuilder {
            session,
            argv,
            cwd: None,
            user: None,
            env: None,
        }
    }

    /// Run in the given directory.
    pub fn cwd(mut self, cwd: &'a Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Run as the given user.
    pub fn user(mut self, user: &'a str) -> Self {
        self.user = Some(user);
        self
    }

    /// Set explicit environment variables.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Run the command and return its stdout, failing on non-zero exit.
    pub fn check_output(self) -> Result<Vec<u8>, Error> {
        self.session
            .check_output(self.argv, self.cwd, self.user, self.env)
    }

    /// Run the command, discarding stdout, failing on non-zero exit.
    pub fn check_call(self) -> Result<(), Error> {
        self.session
            .check_call(self.argv, self.cwd, self.user, self.env)
    }

    /// Run the command, capturing combined stdout+stderr line by line (as
    /// if piped through `tee`) while also mirroring it to the log at debug
    /// level. Returns the exit status and the captured lines regardless of
    /// whether the command succeeded, so callers can inspect output on
    /// failure without a separate run.
    pub fn run_with_tee(self) -> Result<(std::process::ExitStatus, Vec<String>), Error> {
        let mut child = self.session.popen(
            self.argv,
            self.cwd,
            self.user,
            Some(std::process::Stdio::piped()),
            Some(std::process::Stdio::piped()),
            None,
            self.env.as_ref(),
        )?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut lines = Vec::new();

        if let Some(stdout) = stdout {
            use std::io::BufRead;
            for line in std::io::BufReader::new(stdout).lines().map_while(Result::ok) {
                log::debug!("{}", line);
                lines.push(line);
            }
        }
        if let Some(stderr) = stderr {
            use std::io::BufRead;
            for line in std::io::BufReader::new(stderr).lines().map_while(Result::ok) {
                log::debug!("{}", line);
                lines.push(line);
            }
        }

        let status = child.wait()?;
        Ok((status, lines))
    }

    /// Like [`CommandBuilder::run_with_tee`], but aborts the command (via
    /// the stall watchdog's TERM-then-KILL escalation against its process
    /// group) if it produces no output for `stall_timeout`.
    pub fn run_with_tee_and_watchdog(
        self,
        stall_timeout: std::time::Duration,
    ) -> Result<(std::process::ExitStatus, Vec<String>), Error> {
        let mut child = self.session.popen(
            self.argv,
            self.cwd,
            self.user,
            Some(std::process::Stdio::piped()),
            Some(std::process::Stdio::piped()),
            None,
            self.env.as_ref(),
        )?;

        let watchdog = crate::command::StallWatchdog::spawn(
            child.id() as i32,
            stall_timeout,
            std::time::Duration::from_secs(30),
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut lines = Vec::new();

        if let Some(stdout) = stdout {
            use std::io::BufRead;
            for line in std::io::BufReader::new(stdout).lines().map_while(Result::ok) {
                watchdog.touch();
                log::debug!("{}", line);
                lines.push(line);
            }
        }
        if let Some(stderr) = stderr {
            use std::io::BufRead;
            for line in std::io::BufReader::new(stderr).lines().map_while(Result::ok) {
                watchdog.touch();
                log::debug!("{}", line);
                lines.push(line);
            }
        }

        let status = child.wait()?;
        drop(watchdog);
        Ok((status, lines))
    }
}

/// A handle onto one build environment: a chroot, an unshare root, or the
/// bare host. All build-time command execution goes through this trait so
/// callers don't need to know which backend is active.
pub trait Session {
    /// Change the session's current working directory.
    fn chdir(&mut self, path: &Path) -> Result<(), Error>;

    /// The session's current working directory.
    fn pwd(&self) -> &Path;

    /// Map a path as seen inside the session to a path as seen from the
    /// host (e.g. the chroot root joined with the in-session path).
    fn external_path(&self, path: &Path) -> PathBuf;

    /// The root of the session's filesystem tree as seen from the host.
    fn location(&self) -> PathBuf;

    /// Run a command and return its captured stdout.
    fn check_output(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Vec<u8>, Error>;

    /// Run a command, discarding output, failing on non-zero exit.
    fn check_call(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<(), Error>;

    /// Ensure the session's default user has a home directory.
    fn create_home(&self) -> Result<(), Error>;

    /// Whether a path exists inside the session.
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory inside the session.
    fn mkdir(&self, path: &Path) -> Result<(), Error>;

    /// Recursively remove a path inside the session.
    fn rmtree(&self, path: &Path) -> Result<(), Error>;

    /// List the entries of a directory inside the session.
    fn read_dir(&self, path: &Path) -> Result<Vec<std::fs::DirEntry>, Error>;

    /// Export a directory tree from the host into the session, returning a
    /// handle to the resulting project.
    fn project_from_directory(
        &self,
        path: &Path,
        subdir: Option<&str>,
    ) -> Result<Project, Error>;

    /// Spawn a command inside the session without waiting for it.
    #[allow(clippy::too_many_arguments)]
    fn popen(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        stdout: Option<std::process::Stdio>,
        stderr: Option<std::process::Stdio>,
        stdin: Option<std::process::Stdio>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<std::process::Child, Error>;

    /// Whether this session's filesystem is torn down when the session
    /// ends (an unshare root or a freshly-created chroot), as opposed to a
    /// persistent chroot that is reused across sessions.
    fn is_temporary(&self) -> bool;

    /// Start building a command to run inside this session.
    fn command<'a>(&'a self, argv: Vec<&'a str>) -> CommandBuilder<'a> {
        CommandBuilder::new(self, argv)
    }
}

/// Ensure the current (host) user has a home directory inside the session,
/// by creating one if `getent passwd` reports one that doesn't yet exist.
pub fn create_home(session: &dyn Session) -> Result<(), Error> {
    let user = whoami::username();
    let home = format!("/home/{}", user);
    if !session.exists(Path::new(&home)) {
        session.mkdir(Path::new(&home))?;
    }
    Ok(())
}

/// Look up a binary on the session's `PATH`, the way `which` does, or
/// return `None` if it isn't present.
pub fn which(session: &dyn Session, name: &str) -> Option<String> {
    match session.check_output(vec!["which", name], Some(Path::new("/")), None, None) {
        Ok(out) if !out.is_empty() => Some(String::from_utf8_lossy(&out).trim().to_string()),
        _ => None,
    }
}

/// Ask the session who it's running commands as.
pub fn get_user(session: &dyn Session) -> String {
    String::from_utf8(
        session
            .check_output(vec!["sh", "-c", "echo $USER"], Some(Path::new("/")), None, None)
            .unwrap_or_default(),
    )
    .unwrap_or_default()
    .trim()
    .to_string()
}

/// The backend variant a session was created from, tagged so the rest of
/// the crate can make backend-specific decisions (e.g. whether the
/// external-manager wire protocol's `print-execute-command` indirection is
/// available) without downcasting trait objects.
pub enum Backend {
    /// A direct, unprivileged chroot entered via a launcher like
    /// `schroot -c` or a raw `chroot(8)` invocation.
    Direct(direct::DirectSession),
    /// An external chroot manager driven over the line-oriented wire
    /// protocol.
    External(external::ExternalSession),
    /// A Linux user-namespace sandbox.
    Unshare(Box<unshare::UnshareSession>),
}

impl Backend {
    /// Borrow the underlying [`Session`] implementation.
    pub fn session(&self) -> &dyn Session {
        match self {
            Backend::Direct(s) => s,
            Backend::External(s) => s,
            Backend::Unshare(s) => s.as_ref(),
        }
    }

    /// Mutably borrow the underlying [`Session`] implementation.
    pub fn session_mut(&mut self) -> &mut dyn Session {
        match self {
            Backend::Direct(s) => s,
            Backend::External(s) => s,
            Backend::Unshare(s) => s.as_mut(),
        }
    }
}
