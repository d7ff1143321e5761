//! rootfs-builder - prepare distribution root filesystems for packaging.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

use rootfs_builder::build::{self, BuildOptions};
use rootfs_builder::definition::{Definition, RootFilesystem};
use rootfs_builder::filter::TargetType;
use rootfs_builder::preflight;
use rootfs_builder::process::SystemRunner;
use rootfs_builder::sandbox::sys;

#[derive(Parser)]
#[command(name = "rootfs-builder")]
#[command(about = "Build container and VM root filesystems inside a chroot sandbox")]
struct Cli {
    /// Default log level to debug (RUST_LOG still wins)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run repositories, packages and actions on a copy of the source rootfs
    Pack {
        /// Image definition (TOML)
        definition: PathBuf,
        /// Unpacked root filesystem (left untouched)
        source: PathBuf,
        /// Output directory for the finished rootfs or disk image
        target: PathBuf,
        /// Build a VM disk image instead of a container rootfs
        #[arg(long)]
        vm: bool,
        /// Scratch directory for the work tree (default: ~/.cache/rootfs-builder)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Copy the source instead of mounting an overlay over it
        #[arg(long)]
        disable_overlay: bool,
    },

    /// Parse and validate a definition
    Validate {
        definition: PathBuf,
    },

    /// Check that required host tools are installed
    Preflight {
        /// Include VM disk tools
        #[arg(long)]
        vm: bool,
        /// Root filesystem for VM disks
        #[arg(long, value_enum, default_value_t = RootFilesystem::Ext4)]
        filesystem: RootFilesystem,
    },
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn target_type(vm: bool) -> TargetType {
    if vm {
        TargetType::Vm
    } else {
        TargetType::Container
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Pack {
            definition,
            source,
            target,
            vm,
            cache_dir,
            disable_overlay,
        } => {
            if !sys::is_root() {
                anyhow::bail!("pack must be run as root");
            }
            let def = Definition::load(&definition)?;
            let mut options = BuildOptions::new(
                target_type(vm),
                cache_dir.unwrap_or_else(build::default_cache_dir),
            );
            options.disable_overlay = disable_overlay;

            let cancel = options.cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("interrupt received, stopping after the current step");
                cancel.store(true, Ordering::SeqCst);
            })
            .context("Failed to install interrupt handler")?;

            build::pack(&def, &source, &target, &options, &SystemRunner)
                .with_context(|| format!("Failed to pack '{}'", source.display()))?;
            tracing::info!(output = %target.display(), "done");
        }

        Commands::Validate { definition } => {
            let def = Definition::load(&definition)?;
            println!(
                "{}: {} {} ({}, {})",
                definition.display(),
                def.image.distribution,
                def.image.release,
                def.image.architecture,
                def.targets.kind
            );
        }

        Commands::Preflight { vm, filesystem } => {
            preflight::check_host_tools(target_type(vm), filesystem)?;
            println!("All required host tools found.");
        }
    }

    Ok(())
}
