use super::PluginRegistry;
use crate::audit::AuditLog;
use crate::audit_fields;
use crate::config::Config;
use crate::error::{InstallError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of an archive installation.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub name: String,
    pub checksum: String,
    pub replaced: bool,
}

/// Install a plugin package from a ZIP archive and reload the registry.
///
/// The archive is extracted into a scratch directory first; every entry's
/// resolved destination must stay under the scratch root (zip-slip defense)
/// or the whole operation is rejected. The first directory containing a
/// `plugin.toml` names the plugin; a same-named existing package is replaced.
pub fn install_archive(
    data: &[u8],
    config: &Config,
    registry: &PluginRegistry,
    audit: &Arc<AuditLog>,
) -> Result<InstallReport> {
    let scratch = tempfile::tempdir().map_err(InstallError::Io)?;
    safe_extract(data, scratch.path())?;

    let package_dir = find_package_dir(scratch.path()).ok_or(InstallError::MissingManifest)?;
    let name = package_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    if !is_valid_name(&name) {
        return Err(InstallError::InvalidName { name }.into());
    }

    let plugin_root = config.plugin_dir();
    std::fs::create_dir_all(&plugin_root).map_err(InstallError::Io)?;
    let dest = plugin_root.join(&name);
    let replaced = dest.exists();
    if replaced {
        std::fs::remove_dir_all(&dest).map_err(InstallError::Io)?;
    }
    move_dir(&package_dir, &dest)?;

    registry.load(&config.plugin_roots())?;

    let checksum = hex::encode(Sha256::digest(data));
    let record_dir = config.plugin_log_dir();
    if let Err(error) = std::fs::create_dir_all(&record_dir)
        .and_then(|()| std::fs::write(record_dir.join(format!("{name}-checksum.txt")), &checksum))
    {
        tracing::warn!(plugin = %name, %error, "failed to persist install checksum");
    }

    audit.record(
        "plugin.installed",
        audit_fields! {
            "plugin" => name.clone(),
            "checksum" => checksum.clone(),
            "replaced" => replaced,
        },
    );

    Ok(InstallReport {
        name,
        checksum,
        replaced,
    })
}

/// Extract a ZIP, rejecting any entry whose resolved path would escape
/// `dest` (zip-slip).
fn safe_extract(data: &[u8], dest: &Path) -> std::result::Result<(), InstallError> {
    let reader = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;

        // `enclosed_name` refuses absolute paths and any `..` traversal.
        let Some(relative) = entry.enclosed_name() else {
            return Err(InstallError::UnsafePath(entry.name().to_string()));
        };
        let target = dest.join(relative);
        debug_assert!(target.starts_with(dest));

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            std::fs::write(&target, contents)?;
        }
    }
    Ok(())
}

/// Locate the first directory (breadth-first, the root included) holding a
/// `plugin.toml`.
fn find_package_dir(root: &Path) -> Option<PathBuf> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        if dir.join("plugin.toml").is_file() {
            // The scratch root itself cannot name a plugin.
            if dir != root {
                return Some(dir);
            }
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();
        queue.extend(children);
    }
    None
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '+' | '-'))
}

/// Move a directory across filesystems if a plain rename is refused.
fn move_dir(from: &Path, to: &Path) -> std::result::Result<(), InstallError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_dir_recursive(from, to)?;
    std::fs::remove_dir_all(from)?;
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
