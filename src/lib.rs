#![deny(missing_docs)]
//! Isolated package build orchestrator: builds Debian source packages
//! inside ephemeral, isolated sessions, resolving build dependencies
//! through a synthesized signed APT repository rather than mutating a
//! shared chroot.

/// Ephemeral Repo Builder: synthesizes a dummy build-deps package and a
/// signed `Packages`/`Release` index around it.
pub mod archive;
/// Build Artifact Set: parses and verifies `.changes` files.
pub mod changes;
/// Hook command execution: percent-escape substitution and the build
/// stall watchdog.
pub mod command;
/// Error types and the build-stage taxonomy every failure is tagged with.
pub mod error;
/// Orchestrates a single build job end to end.
pub mod job;
/// Log Multiplexer: captures and tags a build's combined output stream.
pub mod log_mux;
/// Job configuration.
pub mod options;
/// Build Pipeline: runs `dpkg-buildpackage`, manages binNMU versioning,
/// and collects the resulting `.changes` files.
pub mod pipeline;
/// Dependency Record: parses, reduces, and evaluates `debian/control`
/// relation fields.
pub mod relations;
/// Dependency Resolver: installs and uninstalls build dependencies
/// inside a session via `apt`.
pub mod resolver;
/// Session backends (direct chroot, external chroot manager, Linux
/// user namespace) behind one `Session` trait.
pub mod session;
/// Session Manager: the build's state machine and its chroot-internal
/// exclusive lock.
pub mod session_manager;
/// Source Reference: fetching and unpacking a `.dsc`, a source package
/// name, or an already-unpacked tree into a build-ready directory.
pub mod source;
