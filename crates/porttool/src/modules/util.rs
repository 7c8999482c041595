use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::metadata::symlink;
use crate::profile::PortProfile;

/// The three run inputs, resolved against the workspace.
#[derive(Debug, Clone)]
pub struct InputPaths {
    pub base_boot: PathBuf,
    pub base_system: PathBuf,
    pub port_zip: PathBuf,
}

pub fn input_paths(profile: &PortProfile, ctx: &ExecCtx) -> Result<InputPaths> {
    let ws = ctx.workspace_paths_or_init(profile)?;
    let resolve = |name: &str, raw: &str| {
        if raw.trim().is_empty() {
            return Err(Error::config(format!("inputs.{name} is not set")));
        }
        ws.resolve_config_path(raw)
    };
    Ok(InputPaths {
        base_boot: resolve("base_boot", &profile.inputs.base_boot)?,
        base_system: resolve("base_system", &profile.inputs.base_system)?,
        port_zip: resolve("port_zip", &profile.inputs.port_zip)?,
    })
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::from(e).context(format!("failed to create dir {}", p.display())))
}

/// Removes `p` if it exists, then recreates it empty.
pub fn reset_dir(p: &Path) -> Result<()> {
    if p.exists() {
        fs::remove_dir_all(p)
            .map_err(|e| Error::from(e).context(format!("failed to remove {}", p.display())))?;
    }
    ensure_dir(p)
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::from(e).context(format!("failed to write {}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::from(e).context(format!("failed to copy {} -> {}", src.display(), dst.display()))
    })?;
    Ok(())
}

/// Recursive copy that recreates symlinks instead of following them.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("walk escaped {}: {e}", src.display())))?;
        let out = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            ensure_dir(&out)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink::create(&target.to_string_lossy(), &out)?;
        } else {
            copy_file(entry.path(), &out)?;
        }
    }
    Ok(())
}

/// Replaces `dst` with `src`: directories wholesale, files byte for byte.
///
/// Returns false when `src` does not exist.
pub fn replace_path(src: &Path, dst: &Path) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(src) else {
        return Ok(false);
    };
    if meta.is_dir() {
        if let Ok(existing) = fs::symlink_metadata(dst) {
            if existing.is_dir() {
                fs::remove_dir_all(dst)?;
            } else {
                fs::remove_file(dst)?;
            }
        }
        copy_dir_all(src, dst)?;
    } else {
        copy_file(src, dst)?;
    }
    Ok(true)
}

/// Sum of regular file sizes under `dir`.
pub fn tree_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total = total.saturating_add(entry.metadata()?.len());
        }
    }
    Ok(total)
}
