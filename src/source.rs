//! Source Reference: where a build's source tree comes from, and the
//! fetch/unpack stages (spec §4.6 steps 1 and 5) that turn it into a
//! directory ready for `debian/control` reading and staging into a
//! session.
//!
//! No teacher file fetches a `.dsc`; the continuation-line-aware deb822
//! field parser below is the same shape as [`crate::changes`]'s
//! `parse_fields` (one field per unindented line, continuation lines
//! indented), and `fetch`'s `apt-get source`/`dpkg-source -x` calls follow
//! the same `session.command(...).check_call()` shelling-out pattern
//! `resolver.rs` uses for every other external command.

use crate::session::Session;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a build's source tree comes from.
#[derive(Debug, Clone)]
pub enum SourceRef {
    /// An already-unpacked source tree on the host. Not one of the two
    /// reference forms spec.md's data model describes (`.dsc` or a
    /// name+version pair); kept as a documented extension so a caller
    /// that already has a checked-out packaging tree doesn't have to
    /// round-trip it through `dpkg-source -b`/`-x`.
    Directory(PathBuf),
    /// A local `.dsc` control file; its `Files:` stanza names the
    /// companion tarballs to stage alongside it before unpacking.
    Dsc(PathBuf),
    /// A source package name (and optional exact version) to resolve via
    /// `apt-get source` inside the session.
    Package {
        /// Source package name.
        name: String,
        /// Exact version to fetch, or `None` for the candidate version.
        version: Option<String>,
    },
}

/// One file listed in a `.dsc`'s `Files`/`Checksums-*` stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DscFileEntry {
    /// File name, relative to the `.dsc`'s directory.
    pub name: String,
    /// Size in bytes, as declared by the `.dsc`.
    pub size: u64,
}

/// A parsed `.dsc` control file: the fields needed to fetch and unpack the
/// source it describes.
#[derive(Debug, Clone)]
pub struct DscFile {
    /// `Source:` field.
    pub source: String,
    /// `Version:` field.
    pub version: String,
    /// `Architecture:` field, space-separated wildcard terms.
    pub architecture: String,
    /// The tarballs (and, for a 3.0 (quilt) source, the debian tarball)
    /// this `.dsc` references.
    pub files: Vec<DscFileEntry>,
}

/// Errors fetching or unpacking a [`SourceRef`].
#[derive(Debug)]
pub enum Error {
    /// A required `.dsc` field was missing.
    MissingField(&'static str),
    /// A `Files:` line didn't have the expected number of columns.
    MalformedFileLine(String),
    /// An I/O error occurred reading the `.dsc` or copying its files.
    Io(std::io::Error),
    /// A session command failed.
    Session(crate::session::Error),
    /// `dpkg-source -x` (or `apt-get source`) didn't leave behind a
    /// directory at the expected, version-derived path.
    NoUnpackedDirectory(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::MissingField(name) => write!(f, "missing field: {}", name),
            Error::MalformedFileLine(line) => write!(f, "malformed file line: {}", line),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Session(e) => write!(f, "{}", e),
            Error::NoUnpackedDirectory(path) => write!(f, "expected unpacked source directory at {}", path),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Session(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<crate::session::Error> for Error {
    fn from(e: crate::session::Error) -> Self {
        Error::Session(e)
    }
}

fn parse_fields(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut current_field: Option<String> = None;
    let mut current_value = String::new();

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if current_field.is_some() {
                current_value.push('\n');
                current_value.push_str(line);
            }
            continue;
        }
        if let Some(field) = current_field.take() {
            fields.insert(field, current_value);
            current_value = String::new();
        }
        if let Some((field, value)) = line.split_once(':') {
            current_field = Some(field.trim().to_lowercase());
            current_value = value.trim().to_string();
        }
    }
    if let Some(field) = current_field {
        fields.insert(field, current_value);
    }
    fields
}

fn parse_file_list(content: &str, columns: usize) -> Result<Vec<Vec<String>>, Error> {
    let mut rows = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if parts.len() != columns {
            return Err(Error::MalformedFileLine(line.to_string()));
        }
        rows.push(parts);
    }
    Ok(rows)
}

impl DscFile {
    /// Parse a `.dsc` file's text.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut fields = parse_fields(content);

        let source = fields.remove("source").ok_or(Error::MissingField("Source"))?;
        let version = fields.remove("version").ok_or(Error::MissingField("Version"))?;
        let architecture = fields.remove("architecture").ok_or(Error::MissingField("Architecture"))?;

        let mut sizes: HashMap<String, u64> = HashMap::new();
        if let Some(raw) = fields.remove("files") {
            // classic `Files:` columns: md5 size name
            for row in parse_file_list(&raw, 3)? {
                let size: u64 = row[1].parse().map_err(|_| Error::MalformedFileLine(format!("{:?}", row)))?;
                sizes.insert(row[2].clone(), size);
            }
        }
        if let Some(raw) = fields.remove("checksums-sha256") {
            for row in parse_file_list(&raw, 3)? {
                let size: u64 = row[1].parse().map_err(|_| Error::MalformedFileLine(format!("{:?}", row)))?;
                sizes.entry(row[2].clone()).or_insert(size);
            }
        }

        let mut files: Vec<DscFileEntry> = sizes.into_iter().map(|(name, size)| DscFileEntry { name, size }).collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DscFile {
            source,
            version,
            architecture,
            files,
        })
    }

    /// Read and parse a `.dsc` file from disk.
    pub fn read(path: &Path) -> Result<Self, Error> {
        Ok(Self::parse(&std::fs::read_to_string(path)?)?)
    }

    /// The directory name `dpkg-source -x` creates for this package: the
    /// source name plus the upstream version (epoch and Debian revision
    /// stripped), matching `dpkg-source`'s own naming.
    pub fn unpacked_dir_name(&self) -> Result<String, String> {
        let version: debversion::Version = self
            .version
            .parse()
            .map_err(|_| format!("unparsable version: {}", self.version))?;
        Ok(format!("{}-{}", self.source, version.upstream_version))
    }
}

/// Where [`SourceRef::fetch`] left the source, in session-internal paths.
pub enum FetchedSource {
    /// Already an unpacked tree, ready to stage directly.
    Unpacked(PathBuf),
    /// A `.dsc` staged alongside its companion files, still needing
    /// `dpkg-source -x`.
    NeedsUnpack { dsc_path: PathBuf, dsc: DscFile },
}

impl SourceRef {
    /// Fetch this reference into `work_dir` (a session-internal path),
    /// downloading/copying whatever is needed but not yet running
    /// `dpkg-source -x` (see [`unpack`]).
    pub fn fetch(&self, session: &dyn Session, work_dir: &Path) -> Result<FetchedSource, Error> {
        match self {
            SourceRef::Directory(dir) => Ok(FetchedSource::Unpacked(dir.clone())),
            SourceRef::Dsc(dsc_path) => {
                let dsc = DscFile::read(dsc_path)?;
                let src_dir = dsc_path.parent().unwrap_or_else(|| Path::new("."));

                if !session.exists(work_dir) {
                    session.mkdir(work_dir)?;
                }
                let host_work_dir = session.external_path(work_dir);
                let dsc_name = dsc_path.file_name().ok_or_else(|| Error::NoUnpackedDirectory(dsc_path.display().to_string()))?;
                let staged_dsc = host_work_dir.join(dsc_name);
                std::fs::copy(dsc_path, &staged_dsc)?;
                for entry in &dsc.files {
                    std::fs::copy(src_dir.join(&entry.name), host_work_dir.join(&entry.name))?;
                }

                Ok(FetchedSource::NeedsUnpack {
                    dsc_path: work_dir.join(dsc_name),
                    dsc,
                })
            }
            SourceRef::Package { name, version } => {
                if !session.exists(work_dir) {
                    session.mkdir(work_dir)?;
                }
                let spec = match version {
                    Some(v) => format!("{}={}", name, v),
                    None => name.clone(),
                };
                session
                    .command(vec!["apt-get", "source", "--download-only", &spec])
                    .cwd(work_dir)
                    .check_call()?;

                let host_work_dir = session.external_path(work_dir);
                let dsc_file_name = std::fs::read_dir(&host_work_dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name())
                    .find(|n| n.to_string_lossy().ends_with(".dsc"))
                    .ok_or_else(|| Error::NoUnpackedDirectory(host_work_dir.display().to_string()))?;
                let dsc = DscFile::read(&host_work_dir.join(&dsc_file_name))?;

                Ok(FetchedSource::NeedsUnpack {
                    dsc_path: work_dir.join(dsc_file_name),
                    dsc,
                })
            }
        }
    }
}

/// Unpack a fetched `.dsc` with `dpkg-source -x` inside `session`, then
/// normalize permissions the way the original buildd tools do
/// (`chmod -R g-s,go+rX`) so the result isn't sensitive to the umask of
/// whoever uploaded the source. Returns the session-internal path to the
/// unpacked tree.
pub fn unpack(session: &dyn Session, work_dir: &Path, fetched: FetchedSource) -> Result<PathBuf, Error> {
    let (dsc_path, dsc) = match fetched {
        FetchedSource::Unpacked(dir) => return Ok(dir),
        FetchedSource::NeedsUnpack { dsc_path, dsc } => (dsc_path, dsc),
    };

    let dir_name = dsc.unpacked_dir_name().map_err(Error::NoUnpackedDirectory)?;
    let unpacked = work_dir.join(&dir_name);

    session
        .command(vec!["dpkg-source", "-x", dsc_path.to_str().unwrap(), dir_name.as_str()])
        .cwd(work_dir)
        .check_call()?;

    if !session.exists(&unpacked) {
        return Err(Error::NoUnpackedDirectory(session.external_path(&unpacked).display().to_string()));
    }

    session
        .command(vec!["chmod", "-R", "g-s,go+rX", unpacked.to_str().unwrap()])
        .check_call()?;

    Ok(unpacked)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Format: 3.0 (quilt)\nSource: hello\nVersion: 2.10-3\nArchitecture: any\nFiles:\n 9e107d9d372bb6826bd81d3542a419d6 724029 hello_2.10.orig.tar.gz\n 1111111111111111111111111111111 4096 hello_2.10-3.debian.tar.xz\n";

    #[test]
    fn test_parse_dsc_fields() {
        let dsc = DscFile::parse(SAMPLE).unwrap();
        assert_eq!(dsc.source, "hello");
        assert_eq!(dsc.version, "2.10-3");
        assert_eq!(dsc.architecture, "any");
        assert_eq!(dsc.files.len(), 2);
    }

    #[test]
    fn test_unpacked_dir_name_strips_debian_revision() {
        let dsc = DscFile::parse(SAMPLE).unwrap();
        assert_eq!(dsc.unpacked_dir_name().unwrap(), "hello-2.10");
    }

    #[test]
    fn test_unpacked_dir_name_native_keeps_full_version() {
        let dsc = DscFile::parse("Source: hello\nVersion: 2.10\nArchitecture: all\nFiles:\n").unwrap();
        assert_eq!(dsc.unpacked_dir_name().unwrap(), "hello-2.10");
    }

    #[test]
    fn test_missing_source_field_errors() {
        let err = DscFile::parse("Version: 1.0\nArchitecture: any\n").unwrap_err();
        assert!(matches!(err, Error::MissingField("Source")));
    }

    #[test]
    fn test_directory_fetch_is_already_unpacked() {
        let td = tempfile::tempdir().unwrap();
        let src = crate::session::direct::DirectSession::new(td.path().to_path_buf(), Vec::new());
        let fetched = SourceRef::Directory(PathBuf::from("/some/tree")).fetch(&src, Path::new("/build")).unwrap();
        assert!(matches!(fetched, FetchedSource::Unpacked(p) if p == PathBuf::from("/some/tree")));
    }
}
