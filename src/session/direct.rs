//! Direct chroot backend: a privileged launcher (`chroot(8)`, `schroot -c`)
//! is prepended to every command instead of driving a persistent manager
//! process.

use super::{CommandBuilder, Error, Project, Session};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A session that runs every command inside a chroot via a launcher binary,
/// with no long-lived manager process behind it.
pub struct DirectSession {
    root: PathBuf,
    launcher: Vec<String>,
    cwd: PathBuf,
}

impl DirectSession {
    /// Create a new direct session rooted at `root`, prefixing every
    /// command with `launcher` (e.g. `["chroot", root]`).
    pub fn new(root: PathBuf, launcher: Vec<String>) -> Self {
        DirectSession {
            root,
            launcher,
            cwd: PathBuf::from("/"),
        }
    }

    fn prepend_user<'a>(&'a self, user: Option<&'a str>, args: Vec<&'a str>) -> Vec<&'a str> {
        let mut full: Vec<&str> = self.launcher.iter().map(String::as_str).collect();
        if let Some(user) = user {
            if user != whoami::username() {
                full.push("sudo");
                full.push("-u");
                full.push(user);
            }
        }
        full.extend(args);
        full
    }

    fn build_command(
        &self,
        argv: Vec<&str>,
        cwd: Option<&Path>,
        user: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> std::process::Command {
        let full = self.prepend_user(user, argv);
        let mut cmd = std::process::Command::new(full[0]);
        cmd.args(&full[1..]);
        if let Some(cwd) = cwd.or(Some(self.cwd.as_path())) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env);
        }
        cmd
    }
}

impl Session for DirectSession {
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
        let output = self.build_command(argv, cwd, user, env).output()?;
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
        let status = self.build_command(argv, cwd, user, env).status()?;
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
        let mut cmd = self.build_command(argv, cwd, user, env.cloned());
        if let Some(stdin) = stdin {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = stderr {
            cmd.stderr(stderr);
        }
        // Make the child its own process group leader so a stall watchdog
        // can signal the whole group it spawns, not just this one pid.
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        Ok(cmd.spawn()?)
    }

    fn is_temporary(&self) -> bool {
        false
    }

    fn command<'a>(&'a self, argv: Vec<&'a str>) -> CommandBuilder<'a> {
        CommandBuilder::new(self, argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_path_absolute() {
        let s = DirectSession::new(PathBuf::from("/srv/chroot/sid"), vec!["chroot".into()]);
        assert_eq!(
            s.external_path(Path::new("/tmp/x")),
            PathBuf::from("/srv/chroot/sid/tmp/x")
        );
    }

    #[test]
    fn test_external_path_relative_uses_cwd() {
        let mut s = DirectSession::new(PathBuf::from("/srv/chroot/sid"), vec!["chroot".into()]);
        s.chdir(Path::new("/build")).unwrap();
        assert_eq!(
            s.external_path(Path::new("out")),
            PathBuf::from("/srv/chroot/sid/build/out")
        );
    }

    #[test]
    fn test_is_temporary() {
        let s = DirectSession::new(PathBuf::from("/srv/chroot/sid"), vec!["chroot".into()]);
        assert!(!s.is_temporary());
    }
}
