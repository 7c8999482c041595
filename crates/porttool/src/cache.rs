//! Digest-gated reuse of the unpacked base system tree.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::tools::SystemExtractor;

pub const RECORD_FILE: &str = "system.digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    Stale { recorded: String },
    Missing,
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::from(e).context(format!("failed to open {}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Layout of the cache directory: the record, the unpacked tree and any
/// config derived from it.
#[derive(Debug, Clone)]
pub struct SystemCache {
    root: PathBuf,
}

impl SystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.root.join("system")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn recorded(&self) -> Option<String> {
        let raw = fs::read_to_string(self.record_path()).ok()?;
        let d = raw.trim();
        (!d.is_empty()).then(|| d.to_string())
    }

    pub fn status(&self, digest: &str) -> CacheStatus {
        match self.recorded() {
            None => CacheStatus::Missing,
            Some(r) if r == digest && self.tree_dir().is_dir() => CacheStatus::Fresh,
            Some(r) => CacheStatus::Stale { recorded: r },
        }
    }

    /// Unpacks `image` unless the cached tree already matches it.
    ///
    /// Returns whether the extractor ran. The record is only written after a
    /// successful extraction.
    pub fn ensure_unpacked(
        &self,
        ctx: &ExecCtx,
        image: &Path,
        extractor: &dyn SystemExtractor,
    ) -> Result<bool> {
        if !image.is_file() {
            return Err(Error::not_found("base system image", image));
        }
        let digest = file_digest(image)?;
        match self.status(&digest) {
            CacheStatus::Fresh => {
                ctx.log(&format!("base system cache hit ({digest})"));
                return Ok(false);
            }
            CacheStatus::Stale { recorded } => {
                ctx.log(&format!("base system changed ({recorded} -> {digest}); re-unpacking"));
            }
            CacheStatus::Missing => ctx.log("no base system cache record; unpacking"),
        }

        match fs::remove_file(self.record_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e).context(format!(
                    "failed to discard {}",
                    self.record_path().display()
                )));
            }
        }
        for dir in [self.tree_dir(), self.config_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| {
                    Error::from(e).context(format!("failed to discard {}", dir.display()))
                })?;
            }
        }
        fs::create_dir_all(&self.root)?;

        extractor.extract(ctx, image, &self.tree_dir())?;
        if !ctx.dry_run {
            fs::write(self.record_path(), format!("{digest}\n"))?;
        }
        Ok(true)
    }
}
