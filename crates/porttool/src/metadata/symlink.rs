//! Symlinks inside the donor tree.
//!
//! Hosts without native symlinks get an emulated link instead: a regular file
//! holding [`EMULATED_MAGIC`], the UTF-16 (BOM, little endian) target and two
//! NUL bytes, flagged with the system file attribute. Both forms are
//! recognised on every host.

use std::fs;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

pub const EMULATED_MAGIC: &[u8; 10] = b"!<symlink>";

#[cfg(windows)]
const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;

pub fn encode_emulated(target: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(EMULATED_MAGIC.len() + 4 + target.len() * 2);
    out.extend_from_slice(EMULATED_MAGIC);
    out.extend_from_slice(&[0xFF, 0xFE]);
    for unit in target.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Returns the target if `bytes` is an emulated link.
pub fn decode_emulated(bytes: &[u8]) -> Option<String> {
    let body = bytes.strip_prefix(EMULATED_MAGIC.as_slice())?;
    let body = body.strip_prefix(&[0xFF, 0xFE]).unwrap_or(body);
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let target = String::from_utf16(&units).ok()?;
    Some(target.trim_end_matches('\0').to_string())
}

pub fn write_emulated(target: &str, link: &Path) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        opts.attributes(FILE_ATTRIBUTE_SYSTEM);
    }
    let mut f = opts
        .open(link)
        .map_err(|e| Error::from(e).context(format!("failed to create {}", link.display())))?;
    std::io::Write::write_all(&mut f, &encode_emulated(target))?;
    Ok(())
}

/// Creates `link -> target`, replacing whatever file or link is already there.
pub fn create(target: &str, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Ok(meta) = fs::symlink_metadata(link) {
        if meta.is_dir() {
            return Err(Error::msg(format!(
                "cannot create symlink {}: a directory is in the way",
                link.display()
            )));
        }
        fs::remove_file(link)?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link).map_err(|e| {
            Error::from(e).context(format!("failed to link {} -> {target}", link.display()))
        })
    }
    #[cfg(not(unix))]
    {
        write_emulated(target, link)
    }
}

/// Target of a native or emulated link, `None` for anything else.
pub fn read_target(path: &Path) -> Result<Option<String>> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        return Ok(Some(target.to_string_lossy().replace('\\', "/")));
    }
    if !meta.is_file() || meta.len() < EMULATED_MAGIC.len() as u64 {
        return Ok(None);
    }

    let mut f = fs::File::open(path)?;
    let mut head = [0u8; 10];
    f.read_exact(&mut head)?;
    if &head != EMULATED_MAGIC {
        return Ok(None);
    }
    let mut bytes = head.to_vec();
    f.read_to_end(&mut bytes)?;
    Ok(decode_emulated(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulated_layout_matches_reparse_format() {
        let bytes = encode_emulated("ab");
        assert_eq!(
            bytes,
            b"!<symlink>\xFF\xFEa\0b\0\0\0".to_vec()
        );
        assert_eq!(decode_emulated(&bytes).as_deref(), Some("ab"));
        assert_eq!(decode_emulated(b"plain file"), None);
    }

    #[test]
    fn emulated_links_are_read_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = tmp.path().join("sh");
        write_emulated("/system/bin/mksh", &link).expect("write");
        assert_eq!(
            read_target(&link).expect("read").as_deref(),
            Some("/system/bin/mksh")
        );
    }

    #[test]
    fn regular_files_are_not_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let f = tmp.path().join("build.prop");
        fs::write(&f, "ro.a=1\nro.b=2\n").expect("write");
        assert_eq!(read_target(&f).expect("read"), None);
        let short = tmp.path().join("x");
        fs::write(&short, "x").expect("write");
        assert_eq!(read_target(&short).expect("read"), None);
    }

    #[test]
    fn create_makes_parents_and_replaces_existing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = tmp.path().join("system/xbin/su");
        create("old", &link).expect("first");
        create("toolbox", &link).expect("second");
        assert_eq!(read_target(&link).expect("read").as_deref(), Some("toolbox"));
    }
}
