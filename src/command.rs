//! Command Channel: percent-escape substitution for hook commands, and the
//! stall watchdog that escalates TERM-then-KILL to a command's whole
//! process group when it stops producing output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One `(short, long)` escape pair and the value it substitutes to, used
/// by [`substitute_percent_escapes`]. Longest-match-wins: the long-form
/// `%SBUILD_*` names are tried before the single-character ones so
/// `%SBUILD_CHANGES` isn't half-consumed as `%S` followed by literal text,
/// and ties among equal-length candidates are broken lexically so
/// substitution is deterministic.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// `%c` / `%SBUILD_CHANGES`: the `.changes` filename.
    pub changes_filename: Option<String>,
    /// `%d` / `%SBUILD_DSC`: path to the `.dsc`.
    pub dsc_path: Option<String>,
    /// `%p` / `%SBUILD_PKGBUILD_DIR`: the unpacked source directory.
    pub pkgbuild_dir: Option<String>,
    /// `%r` / `%SBUILD_CHROOT_DIR`: the session root.
    pub chroot_dir: Option<String>,
    /// `%e` / `%SBUILD_CHROOT_EXEC`: the session exec prefix.
    pub chroot_exec: Option<String>,
    /// `%s` / `%SBUILD_SHELL`: the shell template.
    pub shell: Option<String>,
}

/// One escape name (without the leading `%`) and the field it reads from.
const ESCAPE_TABLE: &[(&str, &str, fn(&HookContext) -> Option<&str>)] = &[
    ("c", "SBUILD_CHANGES", |ctx| ctx.changes_filename.as_deref()),
    ("d", "SBUILD_DSC", |ctx| ctx.dsc_path.as_deref()),
    ("p", "SBUILD_PKGBUILD_DIR", |ctx| ctx.pkgbuild_dir.as_deref()),
    ("r", "SBUILD_CHROOT_DIR", |ctx| ctx.chroot_dir.as_deref()),
    ("e", "SBUILD_CHROOT_EXEC", |ctx| ctx.chroot_exec.as_deref()),
    ("s", "SBUILD_SHELL", |ctx| ctx.shell.as_deref()),
];

impl HookContext {
    /// Look up the value for the escape at the start of `rest` (the text
    /// following a `%`), returning the value and how many bytes of `rest`
    /// the matched escape name consumed. Tries the long `SBUILD_*` names
    /// before the single-character ones (longest match wins); among
    /// candidates of equal length, the lexically smaller name wins, so
    /// matching is always deterministic.
    fn lookup<'a>(&'a self, rest: &str) -> Option<(&'a str, usize)> {
        let mut candidates: Vec<(&'static str, &'a str)> = Vec::new();
        for (short, long, get) in ESCAPE_TABLE {
            if rest.starts_with(long) {
                if let Some(value) = get(self) {
                    candidates.push((long, value));
                }
            }
            if rest.starts_with(short) {
                if let Some(value) = get(self) {
                    candidates.push((short, value));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        candidates.into_iter().next().map(|(name, value)| (value, name.len()))
    }
}

/// Substitute every `%`-escape in `template` using `ctx`, per the table on
/// [`HookContext`]. `%%` is always a literal `%`. Unknown or unset escapes
/// are left untouched (so `%x` in a user-authored command that isn't one
/// of the table above passes through verbatim, rather than silently
/// disappearing).
pub fn substitute_percent_escapes(template: &str, ctx: &HookContext) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'%' {
                i += 1;
            }
            out.push_str(&template[start..i]);
            continue;
        }
        let rest = &template[i + 1..];
        if rest.starts_with('%') {
            out.push('%');
            i += 2;
            continue;
        }
        match ctx.lookup(rest) {
            Some((value, consumed)) => {
                out.push_str(value);
                i += 1 + consumed;
            }
            None => {
                out.push('%');
                i += 1;
            }
        }
    }
    out
}

/// Watches a timestamp that a command's output loop updates on every byte
/// received, and escalates TERM-then-KILL against the command's process
/// group if it goes silent for longer than `stall_timeout`.
///
/// Implemented as a single dedicated thread plus an OS-independent
/// `Instant` check rather than an async runtime or `SIGALRM`, matching the
/// single-timer design used throughout this crate's synchronous session
/// code.
pub struct StallWatchdog {
    last_activity: Arc<Mutex<Instant>>,
    stopped: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StallWatchdog {
    /// Start watching `pgid` for inactivity, checking every `poll_interval`
    /// and firing TERM then (after `poll_interval` more with no reset) KILL
    /// once `stall_timeout` has elapsed with no [`StallWatchdog::touch`] call.
    pub fn spawn(pgid: i32, stall_timeout: Duration, poll_interval: Duration) -> Self {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_last_activity = last_activity.clone();
        let thread_stopped = stopped.clone();
        let handle = std::thread::spawn(move || {
            let mut sent_term = false;
            loop {
                std::thread::sleep(poll_interval);
                if thread_stopped.load(Ordering::SeqCst) {
                    return;
                }
                let elapsed = thread_last_activity.lock().unwrap().elapsed();
                if elapsed < stall_timeout {
                    sent_term = false;
                    continue;
                }
                if !sent_term {
                    log::warn!("no output for {:?}, sending SIGTERM to process group {}", elapsed, pgid);
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(pgid),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                    sent_term = true;
                } else {
                    log::warn!("process group {} still stalled, sending SIGKILL", pgid);
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(pgid),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                    return;
                }
            }
        });

        StallWatchdog {
            last_activity,
            stopped,
            handle: Some(handle),
        }
    }

    /// Reset the inactivity clock; call this whenever the watched command
    /// produces output.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_literal_percent() {
        let ctx = HookContext::default();
        assert_eq!(substitute_percent_escapes("100%% done", &ctx), "100% done");
    }

    #[test]
    fn test_substitute_short_escapes() {
        let ctx = HookContext {
            changes_filename: Some("hello_2.10-3_amd64.changes".to_string()),
            dsc_path: Some("/tmp/hello_2.10-3.dsc".to_string()),
            pkgbuild_dir: Some("/build/hello-2.10".to_string()),
            chroot_dir: Some("/var/lib/ipbo/sid".to_string()),
            chroot_exec: Some("schroot -c sid --".to_string()),
            shell: Some("/bin/bash".to_string()),
        };
        assert_eq!(substitute_percent_escapes("%c", &ctx), "hello_2.10-3_amd64.changes");
        assert_eq!(substitute_percent_escapes("%d", &ctx), "/tmp/hello_2.10-3.dsc");
        assert_eq!(substitute_percent_escapes("%p", &ctx), "/build/hello-2.10");
        assert_eq!(substitute_percent_escapes("%r", &ctx), "/var/lib/ipbo/sid");
        assert_eq!(substitute_percent_escapes("%e", &ctx), "schroot -c sid --");
        assert_eq!(substitute_percent_escapes("%s", &ctx), "/bin/bash");
    }

    #[test]
    fn test_substitute_long_escapes() {
        let ctx = HookContext {
            dsc_path: Some("/tmp/hello_2.10-3.dsc".to_string()),
            ..Default::default()
        };
        assert_eq!(substitute_percent_escapes("%SBUILD_DSC", &ctx), "/tmp/hello_2.10-3.dsc");
    }

    #[test]
    fn test_long_escape_not_shadowed_by_short_prefix() {
        // %SBUILD_CHANGES must not be parsed as %c followed by "HANGES".
        let ctx = HookContext {
            changes_filename: Some("hello.changes".to_string()),
            chroot_dir: Some("should-not-appear".to_string()),
            ..Default::default()
        };
        assert_eq!(substitute_percent_escapes("%SBUILD_CHANGES", &ctx), "hello.changes");
    }

    #[test]
    fn test_substitute_unknown_escape_passes_through() {
        let ctx = HookContext::default();
        assert_eq!(substitute_percent_escapes("%z", &ctx), "%z");
    }

    #[test]
    fn test_substitute_unset_known_escape_passes_through() {
        let ctx = HookContext::default();
        assert_eq!(substitute_percent_escapes("%s", &ctx), "%s");
    }

    #[test]
    fn test_substitute_idempotent_on_plain_text() {
        let ctx = HookContext::default();
        let s = "dpkg-buildpackage -us -uc";
        assert_eq!(substitute_percent_escapes(s, &ctx), s);
    }

    #[test]
    fn test_watchdog_touch_resets_clock() {
        let watchdog = StallWatchdog::spawn(std::process::id() as i32, Duration::from_millis(200), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(100));
        watchdog.touch();
        // Dropping immediately should join cleanly without having escalated.
        drop(watchdog);
    }
}
