//! Build orchestration.
//!
//! [`pack`] prepares a rootfs for packaging: preflight, a work tree over the
//! source, (for VMs) disk creation, then inside the sandbox repositories,
//! post-unpack actions, packages with post-update actions, and post-packages
//! actions. The finished tree or disk image lands in the target directory.

pub mod context;
pub mod overlay;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::definition::{Definition, Trigger};
use crate::filter::{ImageTarget, TargetType};
use crate::managers::pipeline::Pipeline;
use crate::managers::{Backend, Manager};
use crate::preflight;
use crate::process::{run_script, Cmd, CommandRunner};
use crate::sandbox::{self, EnvironmentSet, MountSpec};
use crate::template;
use crate::vm::VmDisk;

pub use context::{default_cache_dir, vm_image_path, BuildOptions};
use overlay::WorkTree;

/// Build `source` into `target`.
///
/// Container builds copy the finished tree into `target`. VM builds write
/// the disk image to `target/<name>.raw`. The source tree is left untouched.
pub fn pack(
    definition: &Definition,
    source: &Path,
    target: &Path,
    options: &BuildOptions,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let mut definition = definition.clone();
    definition.targets.kind = options.target_type;
    definition.validate()?;

    preflight::check_host_tools(options.target_type, definition.targets.vm.filesystem)?;

    let accepted = ImageTarget::for_build(options.target_type);
    tracing::info!(
        distribution = %definition.image.distribution,
        release = %definition.image.release,
        target = %options.target_type,
        "packing rootfs"
    );

    let mut tree = WorkTree::create(runner, options.cache_dir(), source, options.disable_overlay)
        .context("Failed to prepare work tree")?;
    tracing::info!(kind = ?tree.kind(), dir = %tree.path().display(), "work tree ready");

    let result = match options.target_type {
        TargetType::Container => {
            run_sandboxed(&definition, tree.path(), accepted, &[], None, options, runner)
                .and_then(|()| tree.export(runner, target))
        }
        TargetType::Vm => pack_vm(&definition, tree.path(), target, accepted, options, runner),
    };

    if let Err(err) = tree.release() {
        tracing::warn!("{:#}", err);
    }
    result
}

fn pack_vm(
    definition: &Definition,
    rootfs: &Path,
    target: &Path,
    accepted: ImageTarget,
    options: &BuildOptions,
    runner: &dyn CommandRunner,
) -> Result<()> {
    fs::create_dir_all(target)
        .with_context(|| format!("Failed to create '{}'", target.display()))?;

    let mut disk = VmDisk::new(
        runner,
        vm_image_path(definition, target),
        definition.targets.vm.size,
        definition.targets.vm.filesystem,
        options.vm_rootfs_dir(),
    );

    let result = build_in_disk(&mut disk, definition, rootfs, accepted, options, runner);
    let teardown = disk.teardown();
    result?;
    teardown
}

fn build_in_disk(
    disk: &mut VmDisk<'_>,
    definition: &Definition,
    rootfs: &Path,
    accepted: ImageTarget,
    options: &BuildOptions,
    runner: &dyn CommandRunner,
) -> Result<()> {
    disk.build().context("Failed to create VM disk")?;
    copy_tree(runner, rootfs, disk.rootfs_dir())?;

    let uuid = disk.find_partition_uuid(&disk.root_partition()?)?;
    let mounts = disk.sandbox_mounts()?;
    run_sandboxed(
        definition,
        disk.rootfs_dir(),
        accepted,
        &mounts,
        Some(&uuid),
        options,
        runner,
    )
}

/// `rsync -aHAX --numeric-ids <from>/ <to>`
pub(crate) fn copy_tree(runner: &dyn CommandRunner, from: &Path, to: &Path) -> Result<()> {
    runner.run(
        &Cmd::new("rsync")
            .args(["-aHAX", "--numeric-ids"])
            .arg(format!("{}/", from.display()))
            .arg_path(to)
            .error_msg(format!(
                "Failed to copy '{}' into '{}'",
                from.display(),
                to.display()
            )),
    )?;
    Ok(())
}

fn run_sandboxed(
    definition: &Definition,
    rootfs: &Path,
    accepted: ImageTarget,
    extra_mounts: &[MountSpec],
    root_uuid: Option<&str>,
    options: &BuildOptions,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let selector = definition.selector(options.target_type);
    let mut environment = EnvironmentSet::for_build(&definition.environment, &selector, accepted);
    if let Some(uuid) = root_uuid {
        environment.set("ROOT_UUID", uuid);
    }

    let lease = sandbox::enter(rootfs, &environment, extra_mounts)
        .context("Failed to setup chroot")?;
    let result = run_stages(definition, accepted, options, runner);
    let exited = lease.exit().context("Failed to exit chroot");
    result?;
    exited
}

fn has_package_work(definition: &Definition) -> bool {
    let packages = &definition.packages;
    !packages.manager.is_empty()
        || packages.custom_manager.is_some()
        || !packages.sets.is_empty()
        || !packages.repositories.is_empty()
        || packages.update
}

fn run_stages(
    definition: &Definition,
    accepted: ImageTarget,
    options: &BuildOptions,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let ctx = template::context_for(definition)?;

    let manager = if has_package_work(definition) {
        let backend = Backend::from_definition(&definition.packages)?;
        let manager = Manager::new(backend, runner).with_architecture(&definition.image.architecture);
        manager
            .load()
            .with_context(|| format!("Failed to load manager '{}'", manager.backend()))?;
        Some(manager)
    } else {
        None
    };

    let pipeline = manager
        .as_ref()
        .map(|m| Pipeline::new(definition, m, accepted).with_cancel(&options.cancel));

    if let Some(pipeline) = &pipeline {
        tracing::info!("Managing repositories");
        pipeline
            .manage_repositories()
            .context("Failed to manage repositories")?;
    }

    run_actions(definition, Trigger::PostUnpack, accepted, &ctx, runner)?;

    if let Some(pipeline) = &pipeline {
        tracing::info!("Managing packages");
        pipeline
            .manage_packages(&mut || run_actions(definition, Trigger::PostUpdate, accepted, &ctx, runner))
            .context("Failed to manage packages")?;
    }

    run_actions(definition, Trigger::PostPackages, accepted, &ctx, runner)
}

fn run_actions(
    definition: &Definition,
    trigger: Trigger,
    accepted: ImageTarget,
    ctx: &serde_json::Value,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let actions = definition.runnable_actions(trigger, accepted);
    if actions.is_empty() {
        return Ok(());
    }

    tracing::info!(trigger = %trigger, count = actions.len(), "Running hooks");
    for action in actions {
        let script = if action.template {
            template::render(&action.action, ctx)
                .with_context(|| format!("Failed to render {} action", trigger))?
        } else {
            action.action.clone()
        };
        run_script(runner, &script).with_context(|| format!("Failed to run {}", trigger))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;

    fn definition(body: &str) -> Definition {
        Definition::parse(&format!(
            "[image]\ndistribution = \"ubuntu\"\nrelease = \"bionic\"\narchitecture = \"amd64\"\n\n{}",
            body
        ))
        .unwrap()
    }

    #[test]
    fn test_has_package_work() {
        assert!(!has_package_work(&definition("")));
        assert!(has_package_work(&definition("[packages]\nmanager = \"apt\"\n")));
        assert!(has_package_work(&definition(
            "[packages]\nmanager = \"apt\"\n[[packages.sets]]\naction = \"install\"\npackages = [\"vim\"]\n"
        )));
    }

    #[test]
    fn test_actions_run_in_order_with_templates() {
        let def = definition(
            "[[actions]]\ntrigger = \"post-unpack\"\naction = \"#!/bin/sh\\necho first\\n\"\n\n[[actions]]\ntrigger = \"post-unpack\"\ntemplate = true\naction = \"#!/bin/sh\\necho {{ image.release }}\\n\"\n\n[[actions]]\ntrigger = \"post-packages\"\naction = \"#!/bin/sh\\necho later\\n\"\n",
        );
        let runner = RecordingRunner::new();
        let accepted = ImageTarget::for_build(TargetType::Container);
        let ctx = template::context_for(&def).unwrap();

        run_actions(&def, Trigger::PostUnpack, accepted, &ctx, &runner).unwrap();
        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|argv| argv[0].starts_with("/tmp/rootfs-builder_")));
    }

    #[test]
    fn test_action_failure_names_trigger() {
        let def = definition("[[actions]]\ntrigger = \"post-update\"\naction = \"#!/bin/sh\\nexit 1\\n\"\n");
        let runner = RecordingRunner::new();
        runner.fail_on("/tmp/rootfs-builder_");
        let ctx = template::context_for(&def).unwrap();
        let err = run_actions(
            &def,
            Trigger::PostUpdate,
            ImageTarget::for_build(TargetType::Container),
            &ctx,
            &runner,
        )
        .unwrap_err();
        assert!(err.to_string().contains("post-update"));
    }

    #[test]
    fn test_copy_tree_command() {
        let runner = RecordingRunner::new();
        copy_tree(&runner, Path::new("/build/rootfs"), Path::new("/cache/vm-rootfs")).unwrap();
        assert_eq!(
            runner.lines(),
            ["rsync -aHAX --numeric-ids /build/rootfs/ /cache/vm-rootfs"]
        );
    }

    #[test]
    fn test_vm_teardown_runs_in_reverse_after_failed_disk_build() {
        let temp = tempfile::TempDir::new().unwrap();
        let device = temp.path().join("loop9").to_string_lossy().into_owned();
        fs::write(format!("{}p1", device), "").unwrap();
        fs::write(format!("{}p2", device), "").unwrap();

        let runner = RecordingRunner::new();
        runner.respond("losetup -P", &format!("{}\n", device));
        runner.fail_on("mkfs.vfat");

        let def = definition("[targets.vm]\nsize = 1048576\n");
        let options = BuildOptions::new(TargetType::Vm, temp.path().join("cache"));
        let target = temp.path().join("out");
        let err = pack_vm(
            &def,
            &temp.path().join("rootfs"),
            &target,
            ImageTarget::for_build(TargetType::Vm),
            &options,
            &runner,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to create VM disk"));
        assert!(target.join("ubuntu-bionic-amd64.raw").exists());

        let vm = options.vm_rootfs_dir();
        let lines = runner.lines();
        assert_eq!(
            lines[lines.len() - 5..],
            [
                format!("mountpoint -q {}/boot/efi", vm.display()),
                format!("umount -R {}/boot/efi", vm.display()),
                format!("mountpoint -q {}", vm.display()),
                format!("umount -R {}", vm.display()),
                format!("losetup -d {}", device),
            ]
        );
        assert!(!lines.iter().any(|l| l.starts_with("rsync")));
    }

    #[test]
    #[serial_test::serial]
    #[ignore = "requires root"]
    fn test_pack_container_without_packages() {
        let temp = tempfile::TempDir::new().unwrap();
        let source = temp.path().join("rootfs");
        for dir in ["etc", "usr/sbin", "proc", "sys", "dev", "run", "tmp", "bin"] {
            fs::create_dir_all(source.join(dir)).unwrap();
        }
        let def = definition(
            "[[actions]]\ntrigger = \"post-packages\"\naction = \"#!/bin/sh\\necho built > /etc/marker\\n\"\n",
        );
        let options = BuildOptions::new(TargetType::Container, temp.path().join("cache"));
        let target = temp.path().join("out");
        pack(&def, &source, &target, &options, &crate::process::SystemRunner).unwrap();

        assert_eq!(fs::read_to_string(target.join("etc/marker")).unwrap(), "built\n");
        assert!(!source.join("etc/marker").exists());
        assert_eq!(fs::read_dir(target.join("dev")).unwrap().count(), 0);
        for dir in ["overlay", "upper", "work"] {
            assert!(!temp.path().join("cache").join(dir).exists());
        }
    }
}
