//! Donor package (zip) codec.

use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::metadata::symlink;

pub fn extract_all(zip_path: &Path, out_dir: &Path) -> Result<usize> {
    let f = fs::File::open(zip_path)
        .map_err(|e| Error::from(e).context(format!("failed to open {}", zip_path.display())))?;
    let mut zip = ZipArchive::new(BufReader::new(f))?;
    fs::create_dir_all(out_dir)?;
    let count = zip.len();
    zip.extract(out_dir)
        .map_err(|e| Error::from(e).context(format!("failed to extract {}", zip_path.display())))?;
    Ok(count)
}

pub fn entry_names(zip_path: &Path) -> Result<Vec<String>> {
    let f = fs::File::open(zip_path)?;
    let zip = ZipArchive::new(BufReader::new(f))?;
    Ok(zip.file_names().map(ToOwned::to_owned).collect())
}

/// Compresses the contents of `src_dir` into `out_zip`, replacing it.
///
/// Entries are written in sorted path order with a fixed timestamp, so the
/// same tree always produces the same archive. Native and emulated symlinks
/// become zip symlink entries.
pub fn compress_dir(src_dir: &Path, out_zip: &Path) -> Result<usize> {
    if !src_dir.is_dir() {
        return Err(Error::not_found("directory to compress", src_dir));
    }
    if out_zip.exists() {
        fs::remove_file(out_zip)?;
    }
    if let Some(parent) = out_zip.parent() {
        fs::create_dir_all(parent)?;
    }

    let out = fs::File::create(out_zip)
        .map_err(|e| Error::from(e).context(format!("failed to create {}", out_zip.display())))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());

    let mut count = 0usize;
    for entry in WalkDir::new(src_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| Error::msg(format!("walk escaped {}: {e}", src_dir.display())))?;
        let name = rel.to_string_lossy().replace('\\', "/");
        let ft = entry.file_type();

        if ft.is_dir() {
            zip.add_directory(format!("{name}/"), base.unix_permissions(0o755))?;
        } else if let Some(target) = symlink::read_target(entry.path())? {
            zip.add_symlink(name, target, base.unix_permissions(0o777))?;
        } else {
            zip.start_file(name, base.unix_permissions(file_mode(entry.path())))?;
            let mut f = fs::File::open(entry.path())?;
            io::copy(&mut f, &mut zip)?;
        }
        count += 1;
    }
    zip.finish()?;
    Ok(count)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}
