//! Build Artifact Set: parses a `.changes` file's fields and its
//! `Files`/`Checksums-*` stanzas, and verifies the files it lists are
//! actually present with matching hashes.
//!
//! No teacher file parses `.changes`; the continuation-line-aware deb822
//! field parser is adapted from `jelmer-janitor`'s `apt-repository::Release`
//! parser (same shape: one field per unindented line, continuation lines
//! indented, multi-line fields holding one file-list entry per line) rather
//! than guessing at `deb822-lossless`'s `Deb822` struct API, which no file
//! anywhere in this corpus demonstrates using for direct stanza access.

use crate::archive::hash_file;
use std::collections::HashMap;
use std::path::Path;

/// One file listed in a `.changes` file's `Files`/`Checksums-*` stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesFileEntry {
    /// File name (relative to the `.changes` file's directory).
    pub name: String,
    /// Size in bytes, as declared by the `.changes` file.
    pub size: u64,
    /// MD5 digest, from the classic `Files` field.
    pub md5: Option<String>,
    /// SHA1 digest, from `Checksums-Sha1`.
    pub sha1: Option<String>,
    /// SHA256 digest, from `Checksums-Sha256`.
    pub sha256: Option<String>,
}

/// A parsed `.changes` file: the fields `dpkg-genchanges` writes plus the
/// list of artifacts it describes.
#[derive(Debug, Clone)]
pub struct ChangesFile {
    /// `Source:` field.
    pub source: String,
    /// `Version:` field.
    pub version: String,
    /// `Architecture:` field, space-separated (`"amd64 source"` etc).
    pub architecture: String,
    /// `Distribution:` field.
    pub distribution: String,
    /// `Maintainer:` field.
    pub maintainer: Option<String>,
    /// `Changed-By:` field.
    pub changed_by: Option<String>,
    /// `Binary:` field (binary package names), if any.
    pub binary: Option<String>,
    /// The files the `.changes` describes.
    pub files: Vec<ChangesFileEntry>,
}

/// Errors parsing or verifying a `.changes` file.
#[derive(Debug)]
pub enum Error {
    /// A required field was missing.
    MissingField(&'static str),
    /// A `Files`/`Checksums-*` line didn't have the expected number of
    /// whitespace-separated columns.
    MalformedFileLine(String),
    /// An I/O error occurred reading the `.changes` file or an artifact.
    Io(std::io::Error),
    /// A listed file is missing or its hash doesn't match.
    Verification {
        /// The file name that failed verification.
        name: String,
        /// What went wrong.
        reason: String,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::MissingField(name) => write!(f, "missing field: {}", name),
            Error::MalformedFileLine(line) => write!(f, "malformed file line: {}", line),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Verification { name, reason } => write!(f, "{}: {}", name, reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Unfold a deb822 stanza's continuation lines into one `field -> value`
/// map, lower-casing field names the way `.changes` readers normally do.
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

impl ChangesFile {
    /// Parse a `.changes` file's text.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut fields = parse_fields(content);

        let source = fields.remove("source").ok_or(Error::MissingField("Source"))?;
        let version = fields.remove("version").ok_or(Error::MissingField("Version"))?;
        let architecture = fields.remove("architecture").ok_or(Error::MissingField("Architecture"))?;
        let distribution = fields.remove("distribution").ok_or(Error::MissingField("Distribution"))?;
        let maintainer = fields.remove("maintainer");
        let changed_by = fields.remove("changed-by");
        let binary = fields.remove("binary");

        let mut entries: HashMap<String, ChangesFileEntry> = HashMap::new();

        if let Some(raw) = fields.remove("files") {
            // classic `Files:` columns: md5 size section priority name
            for row in parse_file_list(&raw, 5)? {
                let (md5, size, name) = (row[0].clone(), row[1].clone(), row[4].clone());
                let size: u64 = size.parse().map_err(|_| Error::MalformedFileLine(format!("{:?}", row)))?;
                entries
                    .entry(name.clone())
                    .or_insert_with(|| ChangesFileEntry { name, size, md5: None, sha1: None, sha256: None })
                    .md5 = Some(md5);
            }
        }
        if let Some(raw) = fields.remove("checksums-sha1") {
            for row in parse_file_list(&raw, 3)? {
                let (sha1, size, name) = (row[0].clone(), row[1].clone(), row[2].clone());
                let size: u64 = size.parse().map_err(|_| Error::MalformedFileLine(format!("{:?}", row)))?;
                entries
                    .entry(name.clone())
                    .or_insert_with(|| ChangesFileEntry { name, size, md5: None, sha1: None, sha256: None })
                    .sha1 = Some(sha1);
            }
        }
        if let Some(raw) = fields.remove("checksums-sha256") {
            for row in parse_file_list(&raw, 3)? {
                let (sha256, size, name) = (row[0].clone(), row[1].clone(), row[2].clone());
                let size: u64 = size.parse().map_err(|_| Error::MalformedFileLine(format!("{:?}", row)))?;
                entries
                    .entry(name.clone())
                    .or_insert_with(|| ChangesFileEntry { name, size, md5: None, sha1: None, sha256: None })
                    .sha256 = Some(sha256);
            }
        }

        let mut files: Vec<ChangesFileEntry> = entries.into_values().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ChangesFile {
            source,
            version,
            architecture,
            distribution,
            maintainer,
            changed_by,
            binary,
            files,
        })
    }

    /// Read and parse a `.changes` file from disk.
    pub fn read(path: &Path) -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Verify that every listed file is present alongside the `.changes`
    /// file (in `dir`) and that its size and every recorded hash match.
    pub fn verify(&self, dir: &Path) -> Result<(), Error> {
        for entry in &self.files {
            let path = dir.join(&entry.name);
            if !path.exists() {
                return Err(Error::Verification {
                    name: entry.name.clone(),
                    reason: "file is missing".to_string(),
                });
            }
            let digest = hash_file(dir, &path)?;
            if digest.size != entry.size {
                return Err(Error::Verification {
                    name: entry.name.clone(),
                    reason: format!("size mismatch: expected {}, got {}", entry.size, digest.size),
                });
            }
            if let Some(md5) = &entry.md5 {
                if md5 != &digest.md5 {
                    return Err(Error::Verification { name: entry.name.clone(), reason: "MD5 mismatch".to_string() });
                }
            }
            if let Some(sha1) = &entry.sha1 {
                if sha1 != &digest.sha1 {
                    return Err(Error::Verification { name: entry.name.clone(), reason: "SHA1 mismatch".to_string() });
                }
            }
            if let Some(sha256) = &entry.sha256 {
                if sha256 != &digest.sha256 {
                    return Err(Error::Verification { name: entry.name.clone(), reason: "SHA256 mismatch".to_string() });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Format: 1.8\nDate: Sat, 05 Sep 2020 12:35:04 -0000\nSource: hello\nBinary: hello\nArchitecture: source amd64\nVersion: 2.10-3\nDistribution: unstable\nMaintainer: Maintainer <m@example.com>\nChanged-By: Buildd <buildd@example.com>\nFiles:\n 9e107d9d372bb6826bd81d3542a419d6 1024 devel optional hello_2.10-3_amd64.deb\nChecksums-Sha1:\n da39a3ee5e6b4b0d3255bfef95601890afd80709 1024 hello_2.10-3_amd64.deb\nChecksums-Sha256:\n e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 1024 hello_2.10-3_amd64.deb\n";

    #[test]
    fn test_parse_basic_fields() {
        let changes = ChangesFile::parse(SAMPLE).unwrap();
        assert_eq!(changes.source, "hello");
        assert_eq!(changes.version, "2.10-3");
        assert_eq!(changes.distribution, "unstable");
        assert_eq!(changes.binary.as_deref(), Some("hello"));
    }

    #[test]
    fn test_parse_merges_checksums_by_filename() {
        let changes = ChangesFile::parse(SAMPLE).unwrap();
        assert_eq!(changes.files.len(), 1);
        let entry = &changes.files[0];
        assert_eq!(entry.name, "hello_2.10-3_amd64.deb");
        assert_eq!(entry.size, 1024);
        assert!(entry.md5.is_some());
        assert!(entry.sha1.is_some());
        assert!(entry.sha256.is_some());
    }

    #[test]
    fn test_verify_fails_on_missing_file() {
        let changes = ChangesFile::parse(SAMPLE).unwrap();
        let td = tempfile::tempdir().unwrap();
        let err = changes.verify(td.path()).unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));
    }

    #[test]
    fn test_missing_source_field_errors() {
        let err = ChangesFile::parse("Version: 1.0\n").unwrap_err();
        assert!(matches!(err, Error::MissingField("Source")));
    }
}
