//! Repository configuration per backend.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::{Backend, Manager};
use crate::definition::Repository;
use crate::process::Cmd;

pub(super) fn manage(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    match manager.backend() {
        Backend::Apt => apt(manager, repo),
        Backend::Dnf | Backend::Yum => yum(manager, repo),
        Backend::Apk => apk(manager, repo),
        Backend::Pacman => pacman(manager, repo),
        Backend::Xbps => xbps(manager, repo),
        Backend::Zypper => zypper(manager, repo),
        Backend::Opkg | Backend::Custom(_) => {
            tracing::warn!(
                manager = %manager.backend(),
                repository = %repo.name,
                "repositories are not supported by this manager, skipping"
            );
            Ok(())
        }
    }
}

fn apt(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    write_file(
        &manager.path(&format!("/etc/apt/sources.list.d/{}.list", repo.name)),
        &with_newline(&repo.url),
    )?;
    if !repo.key.is_empty() {
        write_file(
            &manager.path(&format!("/etc/apt/trusted.gpg.d/{}.asc", repo.name)),
            &with_newline(&repo.key),
        )?;
    }
    Ok(())
}

/// `url` is either a complete `.repo` file or a bare base URL.
fn yum(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    let content = if repo.url.trim_start().starts_with('[') {
        with_newline(&repo.url)
    } else {
        format!(
            "[{name}]\nname={name}\nbaseurl={url}\nenabled=1\ngpgcheck={check}\n",
            name = repo.name,
            url = repo.url.trim(),
            check = if repo.key.is_empty() { 0 } else { 1 },
        )
    };
    write_file(
        &manager.path(&format!("/etc/yum.repos.d/{}.repo", repo.name)),
        &content,
    )?;

    if !repo.key.is_empty() {
        let key = manager.path(&format!("/etc/pki/rpm-gpg/RPM-GPG-KEY-{}", repo.name));
        write_file(&key, &with_newline(&repo.key))?;
        manager.runner().run(
            &Cmd::new("rpm")
                .arg("--import")
                .arg_path(&key)
                .error_msg(format!("Failed to import key for '{}'", repo.name)),
        )?;
    }
    Ok(())
}

fn apk(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    append_file(&manager.path("/etc/apk/repositories"), &with_newline(&repo.url))?;
    if !repo.key.is_empty() {
        write_file(
            &manager.path(&format!("/etc/apk/keys/{}.rsa.pub", repo.name)),
            &with_newline(&repo.key),
        )?;
    }
    Ok(())
}

fn pacman(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    if !repo.key.is_empty() {
        tracing::warn!(repository = %repo.name, "pacman repository keys are not imported");
    }
    append_file(
        &manager.path("/etc/pacman.conf"),
        &format!("\n[{}]\nServer = {}\n", repo.name, repo.url.trim()),
    )
}

fn xbps(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    write_file(
        &manager.path(&format!("/etc/xbps.d/{}.conf", repo.name)),
        &format!("repository={}\n", repo.url.trim()),
    )
}

fn zypper(manager: &Manager<'_>, repo: &Repository) -> Result<()> {
    let spec = manager.spec();
    manager.runner().run(
        &Cmd::new("zypper")
            .args(&spec.global)
            .args(["addrepo", repo.url.trim(), repo.name.as_str()])
            .error_msg(format!("Failed to add repository '{}'", repo.name)),
    )?;
    Ok(())
}

fn with_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{}\n", content)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    Ok(())
}

pub(super) fn write_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, content).with_context(|| format!("Failed to write '{}'", path.display()))
}

fn append_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to append to '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::PackageManager;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn repo(name: &str, url: &str, key: &str) -> Repository {
        Repository {
            name: name.into(),
            url: url.into(),
            kind: String::new(),
            key: key.into(),
            releases: vec![],
            architectures: vec![],
            variants: vec![],
            types: vec![],
        }
    }

    #[test]
    fn test_apt_writes_list_and_key() {
        let root = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let manager = Manager::new(Backend::Apt, &runner).with_root(root.path());
        manager
            .manage_repository(&repo("extra", "deb http://x bionic universe", "KEY"))
            .unwrap();

        let list = root.path().join("etc/apt/sources.list.d/extra.list");
        assert_eq!(fs::read_to_string(list).unwrap(), "deb http://x bionic universe\n");
        assert!(root.path().join("etc/apt/trusted.gpg.d/extra.asc").exists());
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_yum_generates_repo_and_imports_key() {
        let root = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let manager = Manager::new(Backend::Dnf, &runner).with_root(root.path());
        manager
            .manage_repository(&repo("epel", "https://mirror/epel/8/", "PUBKEY"))
            .unwrap();

        let content = fs::read_to_string(root.path().join("etc/yum.repos.d/epel.repo")).unwrap();
        assert!(content.starts_with("[epel]\n"));
        assert!(content.contains("baseurl=https://mirror/epel/8/\n"));
        assert!(content.contains("gpgcheck=1"));
        let key = root.path().join("etc/pki/rpm-gpg/RPM-GPG-KEY-epel");
        assert_eq!(runner.lines(), [format!("rpm --import {}", key.display())]);
    }

    #[test]
    fn test_yum_keeps_full_repo_file() {
        let root = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let manager = Manager::new(Backend::Yum, &runner).with_root(root.path());
        let body = "[base]\nname=Base\nbaseurl=http://x\n";
        manager.manage_repository(&repo("base", body, "")).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/yum.repos.d/base.repo")).unwrap(),
            body
        );
    }

    #[test]
    fn test_apk_appends() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc/apk")).unwrap();
        fs::write(root.path().join("etc/apk/repositories"), "http://main\n").unwrap();
        let runner = RecordingRunner::new();
        let manager = Manager::new(Backend::Apk, &runner).with_root(root.path());
        manager
            .manage_repository(&repo("testing", "http://testing", ""))
            .unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/apk/repositories")).unwrap(),
            "http://main\nhttp://testing\n"
        );
    }

    #[test]
    fn test_pacman_appends_section() {
        let root = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let manager = Manager::new(Backend::Pacman, &runner).with_root(root.path());
        manager
            .manage_repository(&repo("custom", "http://repo/$arch", ""))
            .unwrap();
        let conf = fs::read_to_string(root.path().join("etc/pacman.conf")).unwrap();
        assert!(conf.contains("[custom]\nServer = http://repo/$arch\n"));
    }

    #[test]
    fn test_zypper_and_xbps() {
        let root = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        Manager::new(Backend::Zypper, &runner)
            .manage_repository(&repo("oss", "http://download/oss", ""))
            .unwrap();
        assert_eq!(
            runner.lines(),
            ["zypper --non-interactive --gpg-auto-import-keys addrepo http://download/oss oss"]
        );

        Manager::new(Backend::Xbps, &runner)
            .with_root(root.path())
            .manage_repository(&repo("void", "https://repo-default.voidlinux.org/current", ""))
            .unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/xbps.d/void.conf")).unwrap(),
            "repository=https://repo-default.voidlinux.org/current\n"
        );
    }

    #[test]
    fn test_opkg_skips_repositories() {
        let runner = RecordingRunner::new();
        Manager::new(Backend::Opkg, &runner)
            .manage_repository(&repo("x", "http://x", ""))
            .unwrap();
        assert!(runner.lines().is_empty());
    }
}
