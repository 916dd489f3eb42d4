//! Log Multiplexer: captures a build's combined stdout/stderr into a
//! rotated log file while also mirroring it live, drawing ASCII
//! section-marker boxes around named build phases, and recognizing a
//! line-oriented control protocol a child process can use to retag or
//! recolour its own output as it's captured.
//!
//! The fd-duplication plumbing (`RedirectOutput`/`CopyOutput`/
//! `DirectoryLogManager`/`rotate_logfile`) is kept near-verbatim from
//! `logs.rs`; the section-marker boxes and the `__SBUILD_FILTER_<pid>:`/
//! `__SBUILD_COLOUR_<pid>:` control-line protocol are new, since the
//! teacher's log manager only ever captures output, it never multiplexes
//! multiple concurrently-tagged sources into one stream.

use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

struct RedirectOutput {
    old_stdout: RawFd,
    old_stderr: RawFd,
}

impl RedirectOutput {
    fn new(to_file: &File) -> io::Result<Self> {
        let stdout = io::stdout();
        let stderr = io::stderr();

        stdout.lock().flush()?;
        stderr.lock().flush()?;

        let old_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
        let old_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };

        if old_stdout == -1 || old_stderr == -1 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::dup2(to_file.as_raw_fd(), libc::STDOUT_FILENO);
            libc::dup2(to_file.as_raw_fd(), libc::STDERR_FILENO);
        }

        Ok(RedirectOutput { old_stdout, old_stderr })
    }
}

impl Drop for RedirectOutput {
    fn drop(&mut self) {
        let stdout = io::stdout();
        let stderr = io::stderr();

        let _ = stdout.lock().flush();
        let _ = stderr.lock().flush();

        unsafe {
            libc::dup2(self.old_stdout, libc::STDOUT_FILENO);
            libc::dup2(self.old_stderr, libc::STDERR_FILENO);
            libc::close(self.old_stdout);
            libc::close(self.old_stderr);
        }
    }
}

struct CopyOutput {
    old_stdout: RawFd,
    old_stderr: RawFd,
    new_fd: Option<RawFd>,
}

impl CopyOutput {
    fn new(output_log: &Path, tee: bool) -> io::Result<Self> {
        let old_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
        let old_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };

        let new_fd = if tee {
            let process = Command::new("tee")
                .arg(output_log)
                .stdin(std::process::Stdio::piped())
                .spawn()?;
            process.stdin.unwrap().as_raw_fd()
        } else {
            File::create(output_log)?.as_raw_fd()
        };

        unsafe {
            libc::dup2(new_fd, libc::STDOUT_FILENO);
            libc::dup2(new_fd, libc::STDERR_FILENO);
        }

        Ok(CopyOutput {
            old_stdout,
            old_stderr,
            new_fd: Some(new_fd),
        })
    }
}

impl Drop for CopyOutput {
    fn drop(&mut self) {
        if let Some(fd) = self.new_fd.take() {
            unsafe {
                libc::fsync(fd);
                libc::close(fd);
            }
        }

        unsafe {
            libc::dup2(self.old_stdout, libc::STDOUT_FILENO);
            libc::dup2(self.old_stderr, libc::STDERR_FILENO);
            libc::close(self.old_stdout);
            libc::close(self.old_stderr);
        }
    }
}

/// Rotate a log file: `foo.log` becomes `foo.log.1`, or `.2` etc. if
/// earlier rotations already exist.
pub fn rotate_logfile(source_path: &Path) -> io::Result<()> {
    if source_path.exists() {
        let directory_path = source_path.parent().unwrap_or_else(|| Path::new(""));
        let name = source_path.file_name().unwrap().to_str().unwrap();

        let mut i = 1;
        while directory_path.join(format!("{}.{}", name, i)).exists() {
            i += 1;
        }

        let target_path: PathBuf = directory_path.join(format!("{}.{}", name, i));
        fs::rename(source_path, &target_path)?;
        log::debug!("storing previous build log at {}", target_path.display());
    }
    Ok(())
}

/// How a [`DirectoryLogManager`] captures the wrapped closure's output.
pub enum LogMode {
    /// Tee to both the log file and the original stdout/stderr.
    Copy,
    /// Redirect entirely into the log file (nothing reaches the terminal).
    Redirect,
}

/// A sink a build's output is captured into.
pub trait LogManager {
    /// Begin capturing.
    fn start(&mut self) -> io::Result<()>;
    /// Stop capturing.
    fn stop(&mut self) {}
}

/// Run `f` with its stdout/stderr captured by `logs`.
pub fn wrap<R>(logs: &mut dyn LogManager, f: impl FnOnce() -> R) -> R {
    logs.start().expect("failed to start log capture");
    let result = f();
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    logs.stop();
    result
}

/// Captures output to a single rotated file under a directory.
pub struct DirectoryLogManager {
    path: PathBuf,
    mode: LogMode,
    copy_output: Option<CopyOutput>,
    redirect_output: Option<RedirectOutput>,
}

impl DirectoryLogManager {
    /// Capture to `path` using `mode`.
    pub fn new(path: PathBuf, mode: LogMode) -> Self {
        Self {
            path,
            mode,
            copy_output: None,
            redirect_output: None,
        }
    }
}

impl LogManager for DirectoryLogManager {
    fn start(&mut self) -> io::Result<()> {
        rotate_logfile(&self.path)?;
        match self.mode {
            LogMode::Copy => self.copy_output = Some(CopyOutput::new(&self.path, true)?),
            LogMode::Redirect => self.redirect_output = Some(RedirectOutput::new(&File::create(&self.path)?)?),
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.copy_output = None;
        self.redirect_output = None;
    }
}

/// Captures nothing; used when no log directory was configured.
#[derive(Default)]
pub struct NoLogManager;

impl LogManager for NoLogManager {
    fn start(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Draw an ASCII box around `title`, the way a build transcript marks the
/// start of a named section (`Installing build dependencies`, `Building`,
/// `Running lintian`, ...).
pub fn section_marker(title: &str) -> String {
    let width = title.len() + 4;
    let bar: String = std::iter::repeat('=').take(width).collect();
    format!("{bar}\n| {title} |\n{bar}\n")
}

/// One line of a captured build transcript, after control-line stripping:
/// either plain output, or a directive a child process sent to retag or
/// recolour its own subsequent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxLine {
    /// Ordinary output, to be written through as-is.
    Output(String),
    /// `__SBUILD_FILTER_<pid>:<pattern>` — suppress subsequent lines from
    /// `pid` matching `pattern` (e.g. a noisy progress bar).
    Filter { pid: u32, pattern: String },
    /// `__SBUILD_COLOUR_<pid>:<code>` — ANSI colour subsequent lines from
    /// `pid` with the given SGR code until the next directive for that pid.
    Colour { pid: u32, code: String },
}

fn control_prefix_pid(line: &str, tag: &str) -> Option<(u32, String)> {
    let rest = line.strip_prefix(tag)?;
    let (pid_str, value) = rest.split_once(':')?;
    let pid = pid_str.parse().ok()?;
    Some((pid, value.to_string()))
}

/// Parse one line of captured output for the filter/colour control
/// protocol, returning plain output for anything that doesn't match.
pub fn parse_mux_line(line: &str) -> MuxLine {
    if let Some((pid, pattern)) = control_prefix_pid(line, "__SBUILD_FILTER_") {
        return MuxLine::Filter { pid, pattern };
    }
    if let Some((pid, code)) = control_prefix_pid(line, "__SBUILD_COLOUR_") {
        return MuxLine::Colour { pid, code };
    }
    MuxLine::Output(line.to_string())
}

/// Applies filter/colour directives from [`parse_mux_line`] across a
/// stream of lines tagged by the pid that produced them, suppressing
/// filtered lines and wrapping coloured ones in the requested SGR code.
#[derive(Default)]
pub struct LineMultiplexer {
    filters: std::collections::HashMap<u32, Vec<String>>,
    colours: std::collections::HashMap<u32, String>,
}

impl LineMultiplexer {
    /// A fresh multiplexer with no active filters or colours.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `(pid, line)` pair through the multiplexer, returning the
    /// line to emit (recoloured if applicable), or `None` if it was
    /// suppressed by an active filter for that pid.
    pub fn feed(&mut self, pid: u32, line: &str) -> Option<String> {
        match parse_mux_line(line) {
            MuxLine::Filter { pid, pattern } => {
                self.filters.entry(pid).or_default().push(pattern);
                None
            }
            MuxLine::Colour { pid, code } => {
                self.colours.insert(pid, code);
                None
            }
            MuxLine::Output(text) => {
                if let Some(patterns) = self.filters.get(&pid) {
                    if patterns.iter().any(|p| text.contains(p.as_str())) {
                        return None;
                    }
                }
                match self.colours.get(&pid) {
                    Some(code) => Some(format!("\x1b[{}m{}\x1b[0m", code, text)),
                    None => Some(text),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_marker_draws_box() {
        let marker = section_marker("Building");
        let lines: Vec<&str> = marker.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], lines[2]);
        assert!(lines[1].contains("Building"));
    }

    #[test]
    fn test_parse_mux_line_plain() {
        assert_eq!(parse_mux_line("hello world"), MuxLine::Output("hello world".to_string()));
    }

    #[test]
    fn test_parse_mux_line_filter() {
        assert_eq!(
            parse_mux_line("__SBUILD_FILTER_1234:progress"),
            MuxLine::Filter { pid: 1234, pattern: "progress".to_string() }
        );
    }

    #[test]
    fn test_parse_mux_line_colour() {
        assert_eq!(
            parse_mux_line("__SBUILD_COLOUR_42:31"),
            MuxLine::Colour { pid: 42, code: "31".to_string() }
        );
    }

    #[test]
    fn test_line_multiplexer_suppresses_filtered_lines() {
        let mut mux = LineMultiplexer::new();
        assert_eq!(mux.feed(1, "__SBUILD_FILTER_1:noisy"), None);
        assert_eq!(mux.feed(1, "this is noisy output"), None);
        assert_eq!(mux.feed(1, "this is fine").as_deref(), Some("this is fine"));
    }

    #[test]
    fn test_line_multiplexer_colours_lines() {
        let mut mux = LineMultiplexer::new();
        assert_eq!(mux.feed(1, "__SBUILD_COLOUR_1:31"), None);
        assert_eq!(mux.feed(1, "error!").as_deref(), Some("\x1b[31merror!\x1b[0m"));
    }

    #[test]
    fn test_line_multiplexer_does_not_cross_pids() {
        let mut mux = LineMultiplexer::new();
        mux.feed(1, "__SBUILD_FILTER_1:secret");
        assert_eq!(mux.feed(2, "a secret line").as_deref(), Some("a secret line"));
    }
}
