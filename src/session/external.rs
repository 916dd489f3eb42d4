//! External chroot manager backend.
//!
//! Speaks the line-oriented wire protocol used to drive an external chroot
//! manager process: `open`/`capabilities`/`print-execute-command`/`close`/
//! `quit`, one command and one reply per line. The manager owns the chroot
//! lifecycle; this backend only asks it to open a session and to print the
//! argv that would run a given command inside it, then executes that argv
//! itself so stdio stays under this process's control.

use super::{CommandBuilder, Error, Project, Session};
use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Strip a session name down to the characters the manager protocol allows.
pub fn sanitize_session_name(name: &str) -> String {
    name.chars()
        .filter(|&c| c.is_alphanumeric() || "_-.".contains(c))
        .collect()
}

/// Build a unique session id by appending a random alphanumeric suffix.
pub fn generate_session_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", sanitize_session_name(prefix), suffix)
}

/// A session driven by an external chroot manager process speaking the
/// line-oriented wire protocol.
pub struct ExternalSession {
    child: RefCell<Child>,
    session_id: String,
    root: PathBuf,
    cwd: PathBuf,
}

impl ExternalSession {
    /// Start the manager binary and open a session against `chroot_name`.
    pub fn open(manager_cmd: &[&str], chroot_name: &str) -> Result<Self, Error> {
        let child = Command::new(manager_cmd[0])
            .args(&manager_cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let session_id = generate_session_id(chroot_name);
        let mut session = ExternalSession {
            child: RefCell::new(child),
            session_id,
            root: PathBuf::new(),
            cwd: PathBuf::from("/"),
        };

        let reply = session.send_line(&format!("open {} {}", chroot_name, session.session_id))?;
        session.root = PathBuf::from(reply.trim());
        Ok(session)
    }

    /// Query the manager for the capabilities of the underlying chroot
    /// implementation (e.g. `union-overlay`, `session-cloning`).
    pub fn capabilities(&self) -> Result<Vec<String>, Error> {
        let reply = self.send_line("capabilities")?;
        Ok(reply.split_whitespace().map(|s| s.to_string()).collect())
    }

    /// Ask the manager for the argv that would run `argv` inside the
    /// session as `user`, without actually executing it.
    pub fn print_execute_command(
        &self,
        argv: &[&str],
        user: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        let mut line = format!("print-execute-command {}", self.session_id);
        if let Some(user) = user {
            line.push_str(" --user=");
            line.push_str(user);
        }
        line.push_str(" -- ");
        line.push_str(&argv.join(" "));
        let reply = self.send_line(&line)?;
        Ok(shlex::split(&reply).unwrap_or_else(|| reply.split_whitespace().map(String::from).collect()))
    }

    fn send_line(&self, line: &str) -> Result<String, Error> {
        let mut child = self.child.borrow_mut();
        let stdin = child.stdin.as_mut().ok_or_else(|| {
            Error::SetupFailure("no stdin".into(), "manager process has no stdin".into())
        })?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;

        let stdout = child.stdout.as_mut().ok_or_else(|| {
            Error::SetupFailure("no stdout".into(), "manager process has no stdout".into())
        })?;
        let mut reader = BufReader::new(stdout);
        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        Ok(reply.trim_end_matches('\n').to_string())
    }

    fn build_argv(&self, argv: Vec<&str>, user: Option<&str>) -> Vec<String> {
        self.print_execute_command(&argv, user)
            .unwrap_or_else(|_| argv.iter().map(|s| s.to_string()).collect())
    }
}

impl Drop for ExternalSession {
    fn drop(&mut self) {
        let _ = self.send_line(&format!("close {}", self.session_id));
        let _ = self.send_line("quit");
        let _ = self.child.borrow_mut().wait();
    }
}

impl Session for ExternalSession {
    fn chdir(&mut self, path: &Path) -> Result<(), Error> {
        self.cwd = self.cwd.join(path);
        Ok(())
    }

    fn pwd(&self) -> &Path {
        &self.cwd
    }

    fn external_path(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("/") {
            self.root.join(rest)
        } else {
            self.root.join(&self.cwd).join(path)
        }
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
        let full = self.build_argv(argv, user);
        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]);
        if let Some(cwd) = cwd.or(Some(self.cwd.as_path())) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env);
        }
        let output = cmd.output()?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::CalledProcessError(output.status))
        }
    }

    fn check_call(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<(), Error> {
        let full = self.build_argv(argv, user);
        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]);
        if let Some(cwd) = cwd.or(Some(self.cwd.as_path())) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env);
        }
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::CalledProcessError(status))
        }
    }

    fn create_home(&self) -> Result<(), Error> {
        super::create_home(self)
    }

    fn exists(&self, path: &Path) -> bool {
        self.check_call(vec!["test", "-e", path.to_str().unwrap()], None, None, None)
            .is_ok()
    }

    fn mkdir(&self, path: &Path) -> Result<(), Error> {
        self.check_call(vec!["mkdir", "-p", path.to_str().unwrap()], None, None, None)
    }

    fn rmtree(&self, path: &Path) -> Result<(), Error> {
        self.check_call(vec!["rm", "-rf", path.to_str().unwrap()], None, None, None)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<std::fs::DirEntry>, Error> {
        std::fs::read_dir(self.external_path(path))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::IoError)
    }

    fn project_from_directory(
        &self,
        path: &Path,
        subdir: Option<&str>,
    ) -> Result<Project, Error> {
        let subdir = subdir.unwrap_or("package");
        let reldir: PathBuf = String::from_utf8(self.check_output(
            vec!["mktemp", "-d", "--tmpdir=/build"],
            Some(Path::new("/")),
            None,
            None,
        )?)
        .unwrap()
        .trim_end_matches('\n')
        .into();
        let export_directory = self.external_path(&reldir).join(subdir);
        let mut options = fs_extra::dir::CopyOptions::new();
        options.copy_inside = true;
        options.overwrite = true;
        fs_extra::dir::copy(path, &export_directory, &options)
            .map_err(|e| Error::SetupFailure("copy failed".into(), e.to_string()))?;
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
        let full = self.build_argv(argv, user);
        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]);
        if let Some(cwd) = cwd.or(Some(self.cwd.as_path())) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env.clone());
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

    fn command<'a>(&'a self, argv: Vec<&'a str>) -> CommandBuilder<'a> {
        CommandBuilder::new(self, argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_session_name() {
        assert_eq!(sanitize_session_name("sid/amd64!"), "sidamd64");
    }

    #[test]
    fn test_generate_session_id_prefix() {
        let id = generate_session_id("sid");
        assert!(id.starts_with("sid-"));
        assert_eq!(id.len(), "sid-".len() + 8);
    }
}
