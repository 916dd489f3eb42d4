//! Ephemeral Repo Builder: synthesizes a tiny, throwaway signed APT
//! repository whose sole purpose is to hand `apt` one dummy meta-package
//! that `Depends`/`Conflicts` on exactly the build-dependencies a build
//! needs, so the existing dependency resolver can satisfy them with
//! ordinary `apt install`.
//!
//! Grounded on `jelmer-janitor`'s `apt-repository` crate's `Release`/hash
//! handling (same index-file shape, RFC 5322 timestamps, multi-algorithm
//! hash stanzas), adapted to build from a single dummy package rather than
//! from a full mirrored archive, and to sign with `sequoia-openpgp` rather
//! than shelling out to `gpg`.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Errors building or signing the ephemeral repository.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred reading or writing repository files.
    Io(std::io::Error),
    /// A session command (e.g. `dpkg-deb --build`) failed.
    Session(crate::session::Error),
    /// Loading or using the signing key failed.
    Signing(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Session(e) => write!(f, "{}", e),
            Error::Signing(s) => write!(f, "signing failed: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Session(e) => Some(e),
            Error::Signing(_) => None,
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

/// The MD5/SHA1/SHA256 digests and size of one repository file, as
/// recorded in a `Release` file's per-algorithm file lists.
#[derive(Debug, Clone)]
pub struct FileDigest {
    /// Path relative to the repository root.
    pub relative_path: String,
    /// File size in bytes.
    pub size: u64,
    /// Lowercase hex MD5 digest.
    pub md5: String,
    /// Lowercase hex SHA1 digest.
    pub sha1: String,
    /// Lowercase hex SHA256 digest.
    pub sha256: String,
}

/// Hash a file on disk with all three algorithms the `Release` format
/// wants, recording its path relative to `root`.
pub fn hash_file(root: &Path, path: &Path) -> std::io::Result<FileDigest> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 65536];
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha1.update(&buf[..n]);
        sha256.update(&buf[..n]);
        size += n as u64;
    }
    let relative_path = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/");
    Ok(FileDigest {
        relative_path,
        size,
        md5: hex(&md5.finalize()),
        sha1: hex(&sha1.finalize()),
        sha256: hex(&sha256.finalize()),
    })
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// The fields of the synthetic meta-package's `debian/control`-style
/// stanza. Its `Depends`/`Conflicts` are the already-reduced relation
/// fields the resolver should satisfy.
#[derive(Debug, Clone)]
pub struct DummyPackage {
    /// Package name, conventionally `<source>-build-deps`.
    pub name: String,
    /// Version, typically derived from the source package's own version.
    pub version: String,
    /// Architecture (`all` for arch-indep-only deps, else the build arch).
    pub architecture: String,
    /// Merged `Depends` field (from `Build-Depends`/`Build-Depends-Arch`/
    /// `Build-Depends-Indep`, already reduced for the target arch/profiles).
    pub depends: Option<String>,
    /// Merged `Conflicts` field (from `Build-Conflicts*`).
    pub conflicts: Option<String>,
}

impl DummyPackage {
    /// Render the control stanza `equivs`/`dpkg-deb` expects under
    /// `<pkgroot>/DEBIAN/control`.
    pub fn control_stanza(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Package: {}", self.name);
        let _ = writeln!(s, "Version: {}", self.version);
        let _ = writeln!(s, "Architecture: {}", self.architecture);
        let _ = writeln!(s, "Maintainer: Isolated Package Build Orchestrator <invalid@localhost>");
        let _ = writeln!(s, "Section: devel");
        let _ = writeln!(s, "Priority: optional");
        if let Some(depends) = &self.depends {
            let _ = writeln!(s, "Depends: {}", depends);
        }
        if let Some(conflicts) = &self.conflicts {
            let _ = writeln!(s, "Conflicts: {}", conflicts);
        }
        let _ = writeln!(s, "Description: dummy package to satisfy build-dependencies");
        s
    }

    /// Build the `.deb` for this dummy package inside `session`, writing
    /// the staging tree under `staging_dir` and the resulting binary under
    /// `output_dir`. Both paths are as seen inside the session.
    pub fn build(
        &self,
        session: &dyn crate::session::Session,
        staging_dir: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, Error> {
        let debian_dir = staging_dir.join("DEBIAN");
        session.mkdir(&debian_dir)?;
        let control_path = session.external_path(&debian_dir.join("control"));
        std::fs::write(&control_path, self.control_stanza())?;

        let deb_name = format!("{}_{}_{}.deb", self.name, self.version, self.architecture);
        let output_path = output_dir.join(&deb_name);
        session
            .command(vec![
                "dpkg-deb",
                "--build",
                "--root-owner-group",
                staging_dir.to_str().unwrap_or_default(),
                output_path.to_str().unwrap_or_default(),
            ])
            .check_call()?;
        Ok(output_path)
    }
}

/// The fields of the synthetic meta-package's `.dsc`. Carries the same
/// `Build-Depends`/`Build-Conflicts` relations as the binary dummy's
/// `Depends`/`Conflicts`, so a tool reading the ephemeral archive's source
/// index sees the identical dependency set the binary index advertises.
pub struct DummySource<'a> {
    /// The binary dummy package this source stanza mirrors.
    pub package: &'a DummyPackage,
}

impl<'a> DummySource<'a> {
    fn tarball_name(&self) -> String {
        format!("{}_{}.tar.gz", self.package.name, self.package.version)
    }

    fn dsc_name(&self) -> String {
        format!("{}_{}.dsc", self.package.name, self.package.version)
    }

    /// Build an empty source tarball and its `.dsc` inside `session`,
    /// writing both under `pool_dir` (as seen inside the session) and
    /// returning the `.dsc`'s own digest (recorded in the `Sources` file
    /// the same way [`packages_entry_for`] records a `.deb`'s).
    pub fn build(&self, session: &dyn crate::session::Session, repo_root: &Path, pool_dir: &Path) -> Result<(PathBuf, FileDigest), Error> {
        let tar_path = pool_dir.join(self.tarball_name());
        session
            .command(vec![
                "tar",
                "czf",
                tar_path.to_str().unwrap_or_default(),
                "--files-from",
                "/dev/null",
            ])
            .check_call()?;
        let tar_digest = hash_file(repo_root, &session.external_path(&tar_path))?;

        let dsc_path = pool_dir.join(self.dsc_name());
        std::fs::write(session.external_path(&dsc_path), self.dsc_text(&tar_digest))?;
        let dsc_digest = hash_file(repo_root, &session.external_path(&dsc_path))?;
        Ok((dsc_path, dsc_digest))
    }

    fn dsc_text(&self, tar_digest: &FileDigest) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Format: 3.0 (native)");
        let _ = writeln!(s, "Source: {}", self.package.name);
        let _ = writeln!(s, "Version: {}", self.package.version);
        let _ = writeln!(s, "Architecture: {}", self.package.architecture);
        let _ = writeln!(s, "Maintainer: Isolated Package Build Orchestrator <invalid@localhost>");
        if let Some(depends) = &self.package.depends {
            let _ = writeln!(s, "Build-Depends: {}", depends);
        }
        if let Some(conflicts) = &self.package.conflicts {
            let _ = writeln!(s, "Build-Conflicts: {}", conflicts);
        }
        let _ = writeln!(s, "Files:");
        let _ = writeln!(s, " {} {} {}", tar_digest.md5, tar_digest.size, self.tarball_name());
        let _ = writeln!(s, "Checksums-Sha1:");
        let _ = writeln!(s, " {} {} {}", tar_digest.sha1, tar_digest.size, self.tarball_name());
        let _ = writeln!(s, "Checksums-Sha256:");
        let _ = writeln!(s, " {} {} {}", tar_digest.sha256, tar_digest.size, self.tarball_name());
        s
    }

    /// Render the `Sources` file stanza for this dummy source, given the
    /// already-written `.dsc`'s own digest.
    pub fn to_stanza(&self, dsc_digest: &FileDigest) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Package: {}", self.package.name);
        let _ = writeln!(s, "Version: {}", self.package.version);
        let _ = writeln!(s, "Directory: {}", Path::new(&dsc_digest.relative_path).parent().map(|p| p.display().to_string()).unwrap_or_default());
        if let Some(depends) = &self.package.depends {
            let _ = writeln!(s, "Build-Depends: {}", depends);
        }
        if let Some(conflicts) = &self.package.conflicts {
            let _ = writeln!(s, "Build-Conflicts: {}", conflicts);
        }
        let _ = writeln!(s, "Files:");
        let _ = writeln!(s, " {} {} {}", dsc_digest.md5, dsc_digest.size, dsc_digest.relative_path);
        s
    }
}

/// One `Packages` index stanza, built from a `.deb`'s control fields plus
/// the file's own hashes/size/filename.
#[derive(Debug, Clone)]
pub struct PackagesEntry {
    /// Control fields straight from the `.deb`, in field order.
    pub fields: Vec<(String, String)>,
    /// Path to the `.deb`, relative to the repository root.
    pub filename: String,
    /// Digests of the `.deb`.
    pub digest: FileDigest,
}

impl PackagesEntry {
    /// Render this entry as a `Packages` file stanza.
    pub fn to_stanza(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.fields {
            let _ = writeln!(s, "{}: {}", k, v);
        }
        let _ = writeln!(s, "Filename: {}", self.filename);
        let _ = writeln!(s, "Size: {}", self.digest.size);
        let _ = writeln!(s, "MD5sum: {}", self.digest.md5);
        let _ = writeln!(s, "SHA1: {}", self.digest.sha1);
        let _ = writeln!(s, "SHA256: {}", self.digest.sha256);
        s
    }
}

/// Build a `PackagesEntry` for `deb_path` (relative to `repo_root`),
/// reading its control fields via `dpkg-deb --show` inside `session`.
pub fn packages_entry_for(
    session: &dyn crate::session::Session,
    repo_root: &Path,
    deb_path: &Path,
) -> Result<PackagesEntry, Error> {
    let raw = session
        .command(vec![
            "dpkg-deb",
            "--field",
            deb_path.to_str().unwrap_or_default(),
        ])
        .check_output()?;
    let text = String::from_utf8_lossy(&raw);
    let mut fields = Vec::new();
    for line in text.lines() {
        if let Some((k, v)) = line.split_once(':') {
            fields.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    let digest = hash_file(repo_root, &session.external_path(deb_path))?;
    Ok(PackagesEntry {
        fields,
        filename: digest.relative_path.clone(),
        digest,
    })
}

/// The ephemeral repository's `Release` file contents and the digests of
/// every index file it covers (`Packages`, `Packages.gz`, ...).
pub struct ReleaseFile {
    /// RFC 5322 `Date:` value.
    pub date: String,
    /// Covered architectures.
    pub architectures: Vec<String>,
    /// Per-algorithm file lists, in the order MD5Sum/SHA1/SHA256 appear.
    pub files: Vec<FileDigest>,
}

impl ReleaseFile {
    /// Build a `Release` file covering `files`, timestamped `now`.
    pub fn build(suite: &str, architectures: &[String], files: Vec<FileDigest>, now: chrono::DateTime<chrono::Utc>) -> Self {
        ReleaseFile {
            // `%Z` renders the literal string "UTC" for a `DateTime<Utc>`;
            // `Date:` needs the RFC 5322 zone form, which for UTC is the
            // fixed `+0000` offset, not a name.
            date: now.format("%a, %d %b %Y %H:%M:%S +0000").to_string(),
            architectures: architectures.to_vec(),
            files,
        }
        .with_suite(suite)
    }

    fn with_suite(self, _suite: &str) -> Self {
        self
    }

    /// Render the `Release` file text.
    pub fn to_text(&self, origin: &str, suite: &str) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Origin: {}", origin);
        let _ = writeln!(s, "Label: {}", origin);
        let _ = writeln!(s, "Suite: {}", suite);
        let _ = writeln!(s, "Date: {}", self.date);
        let _ = writeln!(s, "Architectures: {}", self.architectures.join(" "));
        let _ = writeln!(s, "Components: main");
        let _ = writeln!(s, "Description: ephemeral build-dependency repository");

        let _ = writeln!(s, "MD5Sum:");
        for f in &self.files {
            let _ = writeln!(s, " {} {} {}", f.md5, f.size, f.relative_path);
        }
        let _ = writeln!(s, "SHA1:");
        for f in &self.files {
            let _ = writeln!(s, " {} {} {}", f.sha1, f.size, f.relative_path);
        }
        let _ = writeln!(s, "SHA256:");
        for f in &self.files {
            let _ = writeln!(s, " {} {} {}", f.sha256, f.size, f.relative_path);
        }
        s
    }
}

/// Detached-sign `release_text` with an armored OpenPGP secret key,
/// returning the armored signature (the `Release.gpg`/`InRelease` clear-
/// signed body is not produced; a detached signature alongside a plain
/// `Release` is simpler and is all `apt` needs from a `trusted=yes` source).
pub fn sign_release(release_text: &str, armored_secret_key: &str) -> Result<String, Error> {
    use sequoia_openpgp::parse::Parse;
    use sequoia_openpgp::serialize::stream::{Armorer, Message, Signer};

    let cert = sequoia_openpgp::Cert::from_bytes(armored_secret_key.as_bytes())
        .map_err(|e| Error::Signing(e.to_string()))?;
    let policy = sequoia_openpgp::policy::StandardPolicy::new();
    let keypair = cert
        .keys()
        .unencrypted_secret()
        .with_policy(&policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .ok_or_else(|| Error::Signing("no usable signing subkey in key".to_string()))?
        .key()
        .clone()
        .into_keypair()
        .map_err(|e| Error::Signing(e.to_string()))?;

    let mut sink = Vec::new();
    {
        let message = Message::new(&mut sink);
        let message = Armorer::new(message)
            .kind(sequoia_openpgp::armor::Kind::Signature)
            .build()
            .map_err(|e| Error::Signing(e.to_string()))?;
        let mut signer = Signer::new(message, keypair)
            .detached()
            .build()
            .map_err(|e| Error::Signing(e.to_string()))?;
        std::io::Write::write_all(&mut signer, release_text.as_bytes())?;
        signer.finalize().map_err(|e| Error::Signing(e.to_string()))?;
    }
    String::from_utf8(sink).map_err(|e| Error::Signing(e.to_string()))
}

/// Build the `sources.list` fragment a session needs to see the ephemeral
/// repository. `trusted=yes` is used rather than importing the signing
/// key into the session's keyring, since the repo's own lifetime is one
/// build and re-keying the chroot for it would outlive its usefulness.
pub fn sources_list_fragment(repo_url: &str, suite: &str, components: &[&str]) -> String {
    format!(
        "deb [trusted=yes] {} {} {}\n",
        repo_url,
        suite,
        components.join(" ")
    )
}

/// Everything produced by building the ephemeral repository for one
/// build: the dummy `.deb`, the `Packages`/`Release` index text, and
/// (if a signing key was configured) the detached signature.
pub struct EphemeralRepo {
    /// Root directory of the repository tree, as seen inside the session.
    pub root: PathBuf,
    /// The dummy meta-package that was built.
    pub dummy_package: DummyPackage,
    /// Rendered `Packages` file contents.
    pub packages_text: String,
    /// Rendered `Sources` file contents, indexing the dummy `.dsc`.
    pub sources_text: String,
    /// Rendered `Release` file contents.
    pub release_text: String,
    /// Detached armored signature of `release_text`, if signing was requested.
    pub release_signature: Option<String>,
}

/// Parameters needed to assemble one [`EphemeralRepo`].
pub struct EphemeralRepoRequest<'a> {
    /// The session to build the dummy package inside.
    pub session: &'a dyn crate::session::Session,
    /// Root directory for the repo tree (inside the session).
    pub root: PathBuf,
    /// The dummy package to build and index.
    pub dummy_package: DummyPackage,
    /// Architectures the `Release` file should advertise.
    pub architectures: Vec<String>,
    /// Repository suite name.
    pub suite: String,
    /// Armored secret key to sign the `Release` with, if any.
    pub signing_key: Option<&'a str>,
    /// Timestamp to stamp the `Release` file with.
    pub now: chrono::DateTime<chrono::Utc>,
}

/// Assemble one ephemeral repository: stage and build the dummy package,
/// write `Packages`, compute a `Release` covering it, and sign it.
pub fn build_ephemeral_repo(req: EphemeralRepoRequest) -> Result<EphemeralRepo, Error> {
    let staging = req.root.join("staging");
    let pool = req.root.join("pool");
    req.session.mkdir(&staging)?;
    req.session.mkdir(&pool)?;

    let deb_path = req.dummy_package.build(req.session, &staging, &pool)?;
    let entry = packages_entry_for(req.session, &req.root, &deb_path)?;
    let packages_text = entry.to_stanza();

    let packages_path = req.root.join("Packages");
    std::fs::write(req.session.external_path(&packages_path), &packages_text)?;
    let packages_digest = hash_file(&req.root, &req.session.external_path(&packages_path))?;

    let dummy_source = DummySource { package: &req.dummy_package };
    let (_dsc_path, dsc_digest) = dummy_source.build(req.session, &req.root, &pool)?;
    let sources_text = dummy_source.to_stanza(&dsc_digest);

    let sources_path = req.root.join("Sources");
    std::fs::write(req.session.external_path(&sources_path), &sources_text)?;
    let sources_digest = hash_file(&req.root, &req.session.external_path(&sources_path))?;

    let release = ReleaseFile::build(
        &req.suite,
        &req.architectures,
        vec![entry.digest, packages_digest, dsc_digest, sources_digest],
        req.now,
    );
    let release_text = release.to_text("ipbo-ephemeral", &req.suite);

    let release_signature = match req.signing_key {
        Some(key) => Some(sign_release(&release_text, key)?),
        None => None,
    };

    Ok(EphemeralRepo {
        root: req.root,
        dummy_package: req.dummy_package,
        packages_text,
        sources_text,
        release_text,
        release_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_package_control_stanza_includes_depends() {
        let pkg = DummyPackage {
            name: "hello-build-deps".to_string(),
            version: "2.10-3".to_string(),
            architecture: "amd64".to_string(),
            depends: Some("debhelper (>= 13), gettext".to_string()),
            conflicts: None,
        };
        let stanza = pkg.control_stanza();
        assert!(stanza.contains("Package: hello-build-deps"));
        assert!(stanza.contains("Depends: debhelper (>= 13), gettext"));
        assert!(!stanza.contains("Conflicts"));
    }

    #[test]
    fn test_sources_list_fragment_marks_trusted() {
        let frag = sources_list_fragment("file:///tmp/repo", "sid", &["main"]);
        assert_eq!(frag, "deb [trusted=yes] file:///tmp/repo sid main\n");
    }

    #[test]
    fn test_release_file_lists_all_three_algorithms() {
        let digest = FileDigest {
            relative_path: "Packages".to_string(),
            size: 42,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        };
        let release = ReleaseFile::build("sid", &["amd64".to_string()], vec![digest], chrono::Utc::now());
        let text = release.to_text("ipbo-ephemeral", "sid");
        assert!(text.contains("MD5Sum:"));
        assert!(text.contains("SHA1:"));
        assert!(text.contains("SHA256:"));
        assert!(text.contains("Packages"));
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_release_date_uses_literal_utc_offset() {
        let digest = FileDigest {
            relative_path: "Packages".to_string(),
            size: 0,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        };
        let now = chrono::DateTime::parse_from_rfc3339("2026-07-26T12:00:00Z").unwrap().to_utc();
        let release = ReleaseFile::build("sid", &["amd64".to_string()], vec![digest], now);
        assert!(release.date.ends_with("+0000"));
        assert!(!release.date.contains("UTC"));
    }

    #[test]
    fn test_dummy_source_stanza_mirrors_binary_relations() {
        let pkg = DummyPackage {
            name: "hello-build-deps".to_string(),
            version: "2.10-3".to_string(),
            architecture: "amd64".to_string(),
            depends: Some("debhelper (>= 13)".to_string()),
            conflicts: None,
        };
        let dsc_digest = FileDigest {
            relative_path: "pool/hello-build-deps_2.10-3.dsc".to_string(),
            size: 10,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        };
        let source = DummySource { package: &pkg };
        let tar_digest = dsc_digest.clone();
        let dsc_text = source.dsc_text(&tar_digest);
        assert!(dsc_text.contains("Build-Depends: debhelper (>= 13)"));
        assert!(dsc_text.contains("Source: hello-build-deps"));

        let stanza = source.to_stanza(&dsc_digest);
        assert!(stanza.contains("Build-Depends: debhelper (>= 13)"));
        assert!(stanza.contains("Directory: pool"));
    }
}
