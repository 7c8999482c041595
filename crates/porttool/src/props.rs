//! `key=value` property files (build.prop, default.prop).
//!
//! A [`PropFile`] owns the file's lines in memory. Nothing touches the disk
//! until the file is saved, which happens exactly once: either explicitly via
//! [`PropFile::save`] or, on any other exit path, when the value is dropped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PropFile {
    path: PathBuf,
    lines: Vec<String>,
    flushed: bool,
}

impl PropFile {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::not_found("property file", path));
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("failed to read {}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: raw.lines().map(ToOwned::to_owned).collect(),
            flushed: false,
        })
    }

    /// Opens for lookups only; nothing is written back.
    pub fn read_only(path: &Path) -> Result<Self> {
        let mut props = Self::open(path)?;
        props.flushed = true;
        Ok(props)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Value of the first line starting with `key`, taken after the first `=`.
    pub fn get(&self, key: &str) -> Option<String> {
        let line = self.lines.iter().find(|l| l.starts_with(key))?;
        let value = line.split_once('=').map(|(_, v)| v).unwrap_or_default();
        Some(value.trim_end().to_string())
    }

    /// Rewrites the value of every line containing `key`, keeping that line's
    /// own key (the text before its first `=`). Appends `key=value` when no
    /// line matches.
    pub fn set(&mut self, key: &str, value: &str) {
        let mut hit = false;
        for line in self.lines.iter_mut().filter(|l| l.contains(key)) {
            let own_key = line.split_once('=').map_or(line.as_str(), |(k, _)| k);
            *line = format!("{own_key}={value}");
            hit = true;
        }
        if !hit {
            self.lines.push(format!("{key}={value}"));
        }
    }

    pub fn save(mut self) -> Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        let mut body = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            body.push_str(line);
            body.push('\n');
        }
        fs::write(&self.path, body)
            .map_err(|e| Error::from(e).context(format!("failed to write {}", self.path.display())))
    }
}

impl Drop for PropFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.path.display(), "property write-back failed: {e}");
        }
    }
}

/// Opens `path`, runs `f`, and writes the file back whether or not `f` failed.
///
/// An error from `f` takes precedence over a write-back error.
pub fn edit<T>(path: &Path, f: impl FnOnce(&mut PropFile) -> Result<T>) -> Result<T> {
    let mut props = PropFile::open(path)?;
    let res = f(&mut props);
    let saved = props.save();
    let out = res?;
    saved?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn write_props(dir: &Path, body: &str) -> PathBuf {
        let p = dir.join("build.prop");
        fs::write(&p, body).expect("write props");
        p
    }

    #[test]
    fn open_missing_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = PropFile::open(&tmp.path().join("nope.prop")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn get_uses_first_prefix_match_and_first_equals() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(
            tmp.path(),
            "ro.product.model=A=B  \nro.product.model=second\nro.sf.lcd_density=240\n",
        );
        let props = PropFile::open(&p).expect("open");
        assert_eq!(props.get("ro.product.model").as_deref(), Some("A=B"));
        assert_eq!(props.get("ro.sf.lcd_density").as_deref(), Some("240"));
        assert_eq!(props.get("ro.missing"), None);
    }

    #[test]
    fn set_rewrites_all_occurrences_and_appends_new_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(tmp.path(), "ro.secure=1\nfoo=bar\nro.secure=1\n");
        edit(&p, |props| {
            props.set("ro.secure", "0");
            props.set("ro.debuggable", "1");
            props.set("empty.value", "");
            Ok(())
        })
        .expect("edit");

        let raw = fs::read_to_string(&p).expect("read");
        assert_eq!(
            raw,
            "ro.secure=0\nfoo=bar\nro.secure=0\nro.debuggable=1\nempty.value=\n"
        );
    }

    #[test]
    fn set_keeps_longer_keys_that_contain_the_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(
            tmp.path(),
            "ro.product.locale=en-US\nro.product.locale.language=en\nro.product.locale.region=US\n",
        );
        edit(&p, |props| {
            props.set("ro.product.locale", "zh-CN");
            Ok(())
        })
        .expect("edit");

        let props = PropFile::read_only(&p).expect("reopen");
        assert_eq!(
            props.lines(),
            [
                "ro.product.locale=zh-CN",
                "ro.product.locale.language=zh-CN",
                "ro.product.locale.region=zh-CN",
            ]
        );
        assert_eq!(props.get("ro.product.locale").as_deref(), Some("zh-CN"));
    }

    #[test]
    fn set_then_reopen_round_trips_and_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(tmp.path(), "persist.sys.timezone=UTC\n");
        for _ in 0..2 {
            edit(&p, |props| {
                props.set("persist.sys.timezone", "Asia/Shanghai");
                props.set("ro.product.locale", "zh-CN");
                Ok(())
            })
            .expect("edit");
        }
        let props = PropFile::open(&p).expect("reopen");
        assert_eq!(
            props.get("persist.sys.timezone").as_deref(),
            Some("Asia/Shanghai")
        );
        assert_eq!(props.get("ro.product.locale").as_deref(), Some("zh-CN"));
        assert_eq!(props.lines().len(), 2);
    }

    #[test]
    fn edit_writes_back_even_when_closure_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(tmp.path(), "a=1\n");
        let err = edit(&p, |props| -> Result<()> {
            props.set("a", "2");
            Err(Error::msg("boom"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(fs::read_to_string(&p).expect("read"), "a=2\n");
    }

    #[test]
    fn read_only_never_rewrites() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(tmp.path(), "a=1");
        let props = PropFile::read_only(&p).expect("open");
        assert_eq!(props.get("a").as_deref(), Some("1"));
        drop(props);
        assert_eq!(fs::read_to_string(&p).expect("read"), "a=1");
    }

    #[test]
    fn disk_is_untouched_until_save() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = write_props(tmp.path(), "a=1\n");
        let mut props = PropFile::open(&p).expect("open");
        props.set("a", "2");
        assert_eq!(fs::read_to_string(&p).expect("read"), "a=1\n");
        drop(props);
        assert_eq!(fs::read_to_string(&p).expect("read"), "a=2\n");
    }
}
