use clap::Parser;
use ipbo::job::Job;
use ipbo::options::{ChrootSelector, OptionsBuilder};
use ipbo::source::SourceRef;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(about = "Build a Debian source package inside an isolated session")]
struct Args {
    /// Directory holding the source package to build (must contain `debian/`)
    #[clap(short, long, default_value = ".", conflicts_with_all = ["dsc", "package"])]
    directory: PathBuf,

    /// Build from a local `.dsc` instead of `--directory`
    #[clap(long, conflicts_with = "package")]
    dsc: Option<PathBuf>,

    /// Fetch and build this source package name via `apt-get source`
    #[clap(long)]
    package: Option<String>,

    /// Exact version to fetch with `--package` (defaults to the candidate)
    #[clap(long, requires = "package")]
    package_version: Option<String>,

    /// Where to collect the resulting `.changes`/`.deb`/`.buildinfo` files
    #[clap(short, long, default_value = "..")]
    output_directory: PathBuf,

    /// Base tarball for the unshare backend; omit to bootstrap fresh
    #[clap(long)]
    chroot_tarball: Option<PathBuf>,

    /// Debian suite to bootstrap if `--chroot-tarball` isn't given
    #[clap(long, default_value = "sid")]
    build_suite: String,

    /// Use a direct chroot at this root instead of the unshare backend
    #[clap(long, conflicts_with = "chroot_tarball")]
    chroot: Option<PathBuf>,

    /// Launcher argv prefix for `--chroot`, e.g. `schroot,-c,sid`
    #[clap(long, default_value = "chroot", value_delimiter = ',')]
    chroot_launcher: Vec<String>,

    /// Target architecture; defaults to the session's own architecture
    #[clap(long)]
    host_arch: Option<String>,

    /// Build architecture-independent packages only (`-A`)
    #[clap(long)]
    arch_indep_only: bool,

    /// Build architecture-dependent packages only (`-B`)
    #[clap(long)]
    arch_dep_only: bool,

    /// Extra binary packages to install before resolving build-deps
    #[clap(long, value_delimiter = ',')]
    extra_package: Vec<String>,

    /// GPG key id to sign the ephemeral Release file with
    #[clap(long)]
    signing_key_id: Option<String>,

    /// Directory to write the build transcript under
    #[clap(long)]
    log_dir: Option<PathBuf>,

    /// Produce a source-only `.changes` file
    #[clap(long)]
    source_only_changes: bool,

    #[clap(long)]
    debug: bool,
}

pub fn main() -> std::process::ExitCode {
    let args = Args::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(
            None,
            if args.debug {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
        )
        .init();

    let chroot = match args.chroot {
        Some(root) => ChrootSelector::Direct {
            root,
            launcher: args.chroot_launcher,
        },
        None => ChrootSelector::Unshare {
            tarball: args.chroot_tarball,
            suite: args.build_suite,
        },
    };

    let mut builder = OptionsBuilder::new()
        .chroot(chroot)
        .arch_indep_only(args.arch_indep_only)
        .arch_dep_only(args.arch_dep_only)
        .extra_packages(args.extra_package)
        .source_only_changes(args.source_only_changes);
    if let Some(arch) = args.host_arch {
        builder = builder.host_arch(arch);
    }
    if let Some(key_id) = args.signing_key_id {
        builder = builder.signing_key_id(key_id);
    }
    if let Some(log_dir) = args.log_dir {
        builder = builder.log_dir(log_dir);
    }

    let source = if let Some(dsc) = args.dsc {
        SourceRef::Dsc(dsc)
    } else if let Some(name) = args.package {
        SourceRef::Package { name, version: args.package_version }
    } else {
        SourceRef::Directory(args.directory)
    };

    let job = Job::new(source, args.output_directory, builder.build());

    match job.run() {
        Ok(result) => {
            log::info!("built {} {}", result.source_package, result.version);
            for path in &result.changes_files {
                log::info!("  {}", path.display());
            }
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("build failed: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
