//! fs_config / file_contexts synthesis for the donor system tree.
//!
//! Rows come from two places: the flashing script's `set_metadata*` calls and
//! a walk of the tree for everything the script does not mention. Both tables
//! are sorted before they are written, so output never depends on walk order.

pub mod symlink;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::script::ScriptCommand;

pub const SYSTEM_LABEL: &str = "u:object_r:system_file:s0";
pub const FS_CONFIG_FILE: &str = "system_fs_config";
pub const FILE_CONTEXTS_FILE: &str = "system_file_contexts";

/// Install-time staging area some donor packages ship under the system tree.
const EXCLUDED_SUBTREE: &str = "/tmp/install/";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsExtra {
    None,
    Capabilities(String),
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FsEntry {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub extra: FsExtra,
}

impl FsEntry {
    pub fn new(path: impl Into<String>, uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            path: path.into(),
            uid,
            gid,
            mode,
            extra: FsExtra::None,
        }
    }
}

impl fmt::Display for FsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {:04o}", self.path, self.uid, self.gid, self.mode)?;
        match &self.extra {
            FsExtra::None => Ok(()),
            FsExtra::Capabilities(c) => write!(f, " capabilities={c}"),
            FsExtra::Symlink(t) => write!(f, " {t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FcEntry {
    pub pattern: String,
    pub label: String,
}

impl fmt::Display for FcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pattern, self.label)
    }
}

/// Escapes characters the image builder would read as pattern syntax.
pub fn escape_path(raw: &str) -> String {
    raw.replace('+', "\\+").replace('[', "\\[").replace("//", "/")
}

/// Walked paths keep their literal name; only `[` is escaped.
fn escape_walk_path(raw: &str) -> String {
    raw.replace('[', "\\[")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTables {
    pub fs: Vec<FsEntry>,
    pub fc: Vec<FcEntry>,
}

impl MetadataTables {
    pub fn seeded() -> Self {
        Self {
            fs: vec![
                FsEntry::new("/", 0, 0, 0o755),
                FsEntry::new("/lost\\+found", 0, 0, 0o700),
            ],
            fc: vec![
                FcEntry {
                    pattern: "/".into(),
                    label: SYSTEM_LABEL.into(),
                },
                FcEntry {
                    pattern: "/system(/.*)?".into(),
                    label: SYSTEM_LABEL.into(),
                },
            ],
        }
    }

    /// Materializes `symlink` calls under `rom_root` and records
    /// `set_metadata`/`set_metadata_recursive` rows.
    pub fn apply_script(
        &mut self,
        ctx: &ExecCtx,
        rom_root: &Path,
        cmds: &[ScriptCommand],
    ) -> Result<()> {
        let mut last_path: Option<String> = None;
        for cmd in cmds {
            match cmd.name.as_str() {
                "symlink" => {
                    let Some((target, links)) = cmd.args.split_first() else {
                        continue;
                    };
                    for link in links {
                        let dest = rom_root.join(link.trim_start_matches('/'));
                        ctx.log(&format!("symlink {} -> {target}", dest.display()));
                        symlink::create(target, &dest)?;
                    }
                }
                "set_metadata" | "set_metadata_recursive" => {
                    let recursive = cmd.name == "set_metadata_recursive";
                    let Some((raw_path, kv)) = cmd.args.split_first() else {
                        continue;
                    };
                    let path = escape_path(raw_path);
                    if last_path.as_deref() == Some(path.as_str()) {
                        continue;
                    }
                    let (fs_row, fc_row) = metadata_rows(&path, kv, recursive)?;
                    self.fs.push(fs_row);
                    self.fc.push(fc_row);
                    last_path = Some(path);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Adds default rows for every path under `<rom_root>/system` that has none.
    ///
    /// A walked path counts as covered when its script-escaped form matches an
    /// existing row.
    pub fn reconcile(&mut self, rom_root: &Path) -> Result<()> {
        let system = rom_root.join("system");
        if !system.is_dir() {
            return Err(Error::not_found("donor system tree", &system));
        }

        let mut known: BTreeSet<String> = self.fs.iter().map(|e| e.path.clone()).collect();
        let walker = WalkDir::new(&system)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !in_excluded_subtree(&system, e.path()));
        for entry in walker {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(rom_root)
                .map_err(|e| Error::msg(format!("walk escaped rom root: {e}")))?;
            let literal = rel.to_string_lossy().replace('\\', "/");
            if !known.insert(escape_path(&literal)) {
                continue;
            }
            let path = escape_walk_path(&literal);

            let ft = entry.file_type();
            let row = if ft.is_dir() {
                FsEntry::new(path, 0, 0, 0o755)
            } else if let Some(target) = symlink::read_target(entry.path())? {
                FsEntry {
                    extra: FsExtra::Symlink(target),
                    ..FsEntry::new(path, 0, 2000, 0o755)
                }
            } else {
                let mode = if format!("/{path}").contains("bin/") {
                    0o755
                } else {
                    0o644
                };
                FsEntry::new(path, 0, 2000, mode)
            };
            self.fs.push(row);
        }
        Ok(())
    }

    pub fn sort(&mut self) {
        self.fs.sort();
        self.fc.sort();
    }

    pub fn render_fs_config(&self) -> String {
        render(&self.fs)
    }

    pub fn render_file_contexts(&self) -> String {
        render(&self.fc)
    }

    /// Writes both tables into `dir`, returning (fs_config, file_contexts).
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;
        let fs_config = dir.join(FS_CONFIG_FILE);
        let file_contexts = dir.join(FILE_CONTEXTS_FILE);
        fs::write(&fs_config, self.render_fs_config())?;
        fs::write(&file_contexts, self.render_file_contexts())?;
        Ok((fs_config, file_contexts))
    }
}

fn render<T: fmt::Display>(rows: &[T]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.to_string());
        out.push('\n');
    }
    out
}

fn in_excluded_subtree(system: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(system) else {
        return false;
    };
    format!("/{}/", rel.to_string_lossy().replace('\\', "/")).contains(EXCLUDED_SUBTREE)
}

fn metadata_rows(path: &str, kv: &[String], recursive: bool) -> Result<(FsEntry, FcEntry)> {
    let mut uid = 0;
    let mut gid = 0;
    let mut mode = 0o644;
    let mut dmode = None;
    let mut extra = FsExtra::None;
    let mut label = SYSTEM_LABEL.to_string();

    let mut i = 0;
    while i + 1 < kv.len() {
        let (key, value) = (kv[i].as_str(), kv[i + 1].as_str());
        match key {
            "uid" => uid = parse_id(path, key, value)?,
            "gid" => gid = parse_id(path, key, value)?,
            "mode" | "fmode" => mode = parse_mode(path, value)?,
            "dmode" => dmode = Some(parse_mode(path, value)?),
            "capabilities" => {
                extra = if is_zero_mask(value) {
                    FsExtra::None
                } else {
                    FsExtra::Capabilities(value.to_string())
                };
            }
            "selabel" => label = value.to_string(),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    // A recursive row describes the directory itself, so dmode beats mode and
    // fmode wherever it appears in the argument list.
    if recursive && let Some(d) = dmode {
        mode = d;
    }

    Ok((
        FsEntry {
            path: path.trim_start_matches('/').to_string(),
            uid,
            gid,
            mode,
            extra,
        },
        FcEntry {
            pattern: path.to_string(),
            label,
        },
    ))
}

fn parse_id(path: &str, key: &str, raw: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| Error::msg(format!("invalid {key} '{raw}' for {path}")))
}

fn parse_mode(path: &str, raw: &str) -> Result<u32> {
    u32::from_str_radix(raw, 8).map_err(|_| Error::msg(format!("invalid mode '{raw}' for {path}")))
}

fn is_zero_mask(raw: &str) -> bool {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    !digits.is_empty() && digits.chars().all(|c| c == '0')
}

/// Full synthesis over an unpacked donor tree: seed, script, walk, sort.
pub fn synthesize(ctx: &ExecCtx, rom_root: &Path, script: Option<&str>) -> Result<MetadataTables> {
    let mut tables = MetadataTables::seeded();
    let cmds = script.map(crate::script::parse).unwrap_or_default();
    if cmds.is_empty() {
        ctx.warn("no commands recovered from flashing script; using tree walk only");
    }
    tables.apply_script(ctx, rom_root, &cmds)?;
    tables.reconcile(rom_root)?;
    tables.sort();
    ctx.log(&format!(
        "metadata: {} fs_config rows, {} file_contexts rows",
        tables.fs.len(),
        tables.fc.len()
    ));
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::{ChannelSink, ExecCtx};
    use crate::script::parse;

    fn ctx() -> ExecCtx {
        let (tx, _rx) = std::sync::mpsc::channel();
        ExecCtx::new(false, Arc::new(ChannelSink::new(tx)))
    }

    fn rom() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sys = tmp.path().join("system");
        fs::create_dir_all(sys.join("bin")).expect("mkdir");
        fs::create_dir_all(sys.join("etc")).expect("mkdir");
        fs::write(sys.join("bin/x"), b"\x7fELF").expect("write");
        fs::write(sys.join("etc/hosts"), b"127.0.0.1 localhost\n").expect("write");
        fs::write(sys.join("build.prop"), b"ro.a=1\n").expect("write");
        tmp
    }

    #[test]
    fn set_metadata_row_is_rendered_verbatim() {
        let tmp = rom();
        let script = r#"set_metadata("/system/bin/x", "uid", "0", "gid", "2000", "mode", "0755");"#;
        let tables = synthesize(&ctx(), tmp.path(), Some(script)).expect("synthesize");
        let fs_config = tables.render_fs_config();
        assert!(
            fs_config.lines().any(|l| l == "system/bin/x 0 2000 0755"),
            "{fs_config}"
        );
        assert!(
            tables
                .render_file_contexts()
                .lines()
                .any(|l| l == "/system/bin/x u:object_r:system_file:s0")
        );
    }

    #[test]
    fn defaults_capabilities_and_labels() {
        let cmds = parse(
            r#"set_metadata("/system/bin/ping", "capabilities", "0x2000", "selabel", "u:object_r:ping_exec:s0");
               set_metadata("/system/bin/ls", "uid", 0, "capabilities", 0x0);"#,
        );
        let mut tables = MetadataTables::default();
        tables
            .apply_script(&ctx(), Path::new("/nonexistent"), &cmds)
            .expect("apply");
        assert_eq!(
            tables.fs[0].to_string(),
            "system/bin/ping 0 0 0644 capabilities=0x2000"
        );
        assert_eq!(tables.fc[0].label, "u:object_r:ping_exec:s0");
        assert_eq!(tables.fs[1].to_string(), "system/bin/ls 0 0 0644");
    }

    #[test]
    fn recursive_dmode_wins_regardless_of_argument_order() {
        let cmds = parse(
            r#"set_metadata_recursive("/system/vendor", "uid", 0, "gid", 2000, "dmode", 0755, "fmode", 0644);
               set_metadata_recursive("/system/xbin", "fmode", 0700, "dmode", 0750, "mode", 0600);
               set_metadata("/system/app", "dmode", 0750, "mode", 0700);"#,
        );
        let mut tables = MetadataTables::default();
        tables
            .apply_script(&ctx(), Path::new("/nonexistent"), &cmds)
            .expect("apply");
        assert_eq!(tables.fs[0].mode, 0o755);
        assert_eq!(tables.fs[1].mode, 0o750);
        assert_eq!(tables.fs[2].mode, 0o700);
    }

    #[test]
    fn walked_rows_keep_literal_names() {
        let tmp = rom();
        let lib = tmp.path().join("system/lib");
        fs::create_dir_all(&lib).expect("mkdir");
        fs::write(lib.join("libc++.so"), b"\x7fELF").expect("write");
        fs::write(lib.join("libstdc++.so"), b"\x7fELF").expect("write");
        fs::write(lib.join("[odd].so"), b"x").expect("write");

        let script = r#"set_metadata("/system/lib/libstdc++.so", "uid", 0, "gid", 0, "mode", 0600);"#;
        let tables = synthesize(&ctx(), tmp.path(), Some(script)).expect("synthesize");
        let rows: Vec<String> = tables.fs.iter().map(ToString::to_string).collect();

        assert!(rows.contains(&"system/lib/libc++.so 0 2000 0644".to_string()), "{rows:?}");
        assert!(rows.contains(&"system/lib/\\[odd].so 0 2000 0644".to_string()), "{rows:?}");
        assert!(!rows.iter().any(|r| r.starts_with("system/lib/libc\\+")), "{rows:?}");
        let stdcxx: Vec<&String> = rows.iter().filter(|r| r.contains("libstdc")).collect();
        assert_eq!(stdcxx, ["system/lib/libstdc\\+\\+.so 0 0 0600"]);
    }

    #[test]
    fn consecutive_duplicates_collapse_and_specials_are_escaped() {
        let cmds = parse(
            r#"set_metadata("/system/lib/c++.so", "mode", 0600);
               set_metadata("/system/lib/c++.so", "mode", 0644);
               set_metadata("/system//etc/[x]", "mode", 0644);"#,
        );
        let mut tables = MetadataTables::default();
        tables
            .apply_script(&ctx(), Path::new("/nonexistent"), &cmds)
            .expect("apply");
        assert_eq!(tables.fs.len(), 2);
        assert_eq!(tables.fs[0].path, "system/lib/c\\+\\+.so");
        assert_eq!(tables.fs[0].mode, 0o600);
        assert_eq!(tables.fc[1].pattern, "/system/etc/\\[x]");
    }

    #[test]
    fn invalid_mode_is_an_error() {
        let cmds = parse(r#"set_metadata("/system/bin/x", "mode", "rwx");"#);
        let mut tables = MetadataTables::default();
        assert!(
            tables
                .apply_script(&ctx(), Path::new("/nonexistent"), &cmds)
                .is_err()
        );
    }

    #[test]
    fn walk_fills_gaps_without_duplicates() {
        let tmp = rom();
        fs::create_dir_all(tmp.path().join("system/tmp/install/bin")).expect("mkdir");
        fs::write(tmp.path().join("system/tmp/install/bin/busybox"), b"x").expect("write");

        let script = r#"set_metadata_recursive("/system/etc", "uid", 0, "gid", 0, "dmode", 0755, "fmode", 0644);"#;
        let tables = synthesize(&ctx(), tmp.path(), Some(script)).expect("synthesize");
        let rows: Vec<String> = tables.fs.iter().map(ToString::to_string).collect();

        assert_eq!(
            rows,
            [
                "/ 0 0 0755",
                "/lost\\+found 0 0 0700",
                "system 0 0 0755",
                "system/bin 0 0 0755",
                "system/bin/x 0 2000 0755",
                "system/build.prop 0 2000 0644",
                "system/etc 0 0 0755",
                "system/etc/hosts 0 2000 0644",
                "system/tmp 0 0 0755",
            ]
        );
        let paths: BTreeSet<&str> = tables.fs.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths.len(), tables.fs.len());
    }

    #[test]
    fn script_symlinks_are_created_and_recorded() {
        let tmp = rom();
        let script = r#"symlink("toolbox", "/system/bin/ls", "/system/bin/ps");"#;
        let tables = synthesize(&ctx(), tmp.path(), Some(script)).expect("synthesize");
        assert_eq!(
            symlink::read_target(&tmp.path().join("system/bin/ps"))
                .expect("read")
                .as_deref(),
            Some("toolbox")
        );
        let fs_config = tables.render_fs_config();
        assert!(fs_config.contains("system/bin/ls 0 2000 0755 toolbox\n"), "{fs_config}");
    }

    #[test]
    fn empty_script_falls_back_to_walk() {
        let tmp = rom();
        let tables = synthesize(&ctx(), tmp.path(), Some("garbage")).expect("synthesize");
        assert_eq!(tables.fc.len(), 2);
        assert!(tables.fs.iter().any(|e| e.path == "system/etc/hosts"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let tmp = rom();
        let script = r#"symlink("toolbox", "/system/bin/ls");
set_metadata("/system/bin/x", "uid", 0, "gid", 2000, "mode", 0755);"#;
        let a = synthesize(&ctx(), tmp.path(), Some(script)).expect("first");
        let b = synthesize(&ctx(), tmp.path(), Some(script)).expect("second");
        assert_eq!(a.render_fs_config(), b.render_fs_config());
        assert_eq!(a.render_file_contexts(), b.render_file_contexts());
    }
}
