//! Filesystem helpers used inside coordinated accesses.
//!
//! Writes are staged next to the target and published with a rename, so a
//! failed write never leaves a truncated item behind.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::codec::Representation;

/// Read a file as a flat representation or a directory as a package.
pub fn read_representation(path: &Path) -> Result<Representation> {
    let meta = fs::metadata(path).with_context(|| format!("no item at {}", path.display()))?;
    if !meta.is_dir() {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        return Ok(Representation::Flat(Bytes::from(bytes)));
    }

    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(path)?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = fs::read(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        entries.insert(key, Bytes::from(bytes));
    }
    Ok(Representation::Package(entries))
}

/// Atomically replace the item at `target` with `representation`.
pub fn write_representation_atomically(target: &Path, representation: &Representation) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(parent)?;
    let staging = sibling(target, "tmp")?;

    let staged = match representation {
        Representation::Flat(bytes) => stage_file(&staging, bytes),
        Representation::Package(entries) => stage_package(&staging, entries),
    };
    if let Err(e) = staged {
        let _ = remove_item(&staging);
        return Err(e);
    }

    if let Err(e) = publish(&staging, target) {
        let _ = remove_item(&staging);
        return Err(e);
    }
    Ok(())
}

/// Copy an item (file or package) to `to`, replacing whatever is there.
pub fn copy_item(from: &Path, to: &Path) -> Result<()> {
    let representation = read_representation(from)?;
    write_representation_atomically(to, &representation)
}

pub fn remove_item(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn modification_date(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Compare two locations after standardizing them. Locations that do not
/// exist yet are compared through their canonical parent.
pub fn same_location(a: &Path, b: &Path) -> bool {
    standardize(a) == standardize(b)
}

pub fn standardize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = parent.canonicalize() {
            return parent.join(name);
        }
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn sibling(target: &Path, suffix: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", target.display()))?
        .to_string_lossy();
    Ok(target.with_file_name(format!(".{}.{}.{}", name, Uuid::new_v4(), suffix)))
}

fn stage_file(staging: &Path, bytes: &Bytes) -> Result<()> {
    let mut file = File::create(staging)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn stage_package(staging: &Path, entries: &BTreeMap<String, Bytes>) -> Result<()> {
    fs::create_dir_all(staging)?;
    for (name, bytes) in entries {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid package entry name {name:?}");
        }
        let path = staging.join(relative);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        stage_file(&path, bytes)?;
    }
    Ok(())
}

fn publish(staging: &Path, target: &Path) -> Result<()> {
    let replacing_dir = fs::symlink_metadata(target).map(|m| m.is_dir()).unwrap_or(false);
    let staged_dir = fs::metadata(staging)?.is_dir();

    // A rename cannot replace a directory, so move the old one aside first.
    if replacing_dir || (staged_dir && target.exists()) {
        let backup = sibling(target, "old")?;
        fs::rename(target, &backup)
            .with_context(|| format!("moving aside {}", target.display()))?;
        if let Err(e) = fs::rename(staging, target) {
            let _ = fs::rename(&backup, target);
            return Err(e).with_context(|| format!("publishing {}", target.display()));
        }
        let _ = remove_item(&backup);
        return Ok(());
    }

    fs::rename(staging, target).with_context(|| format!("publishing {}", target.display()))?;
    Ok(())
}
