//! External collaborators: boot image codec, system image extractor and the
//! ext4 image builder.
//!
//! Stages only see the traits. The command-backed implementations shell out
//! through [`ExecCtx::run_cmd`] so their output lands in the task log.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::profile::ToolsConfig;

pub trait BootImageTool: Send + Sync {
    /// Unpacks `image` next to itself (kernel, ramdisk tree, info file).
    fn unpack(&self, ctx: &ExecCtx, image: &Path) -> Result<()>;

    /// Repacks the unpacked tree in `dir` and returns the new image path.
    fn repack(&self, ctx: &ExecCtx, dir: &Path) -> Result<PathBuf>;
}

pub trait SystemExtractor: Send + Sync {
    /// Extracts the filesystem tree of `image` into `out_dir`.
    fn extract(&self, ctx: &ExecCtx, image: &Path, out_dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsImageRequest {
    pub size: u64,
    pub fs_config: PathBuf,
    pub file_contexts: PathBuf,
    pub label: String,
    pub mount_point: String,
    pub output: PathBuf,
    pub source_dir: PathBuf,
}

pub trait FsImageBuilder: Send + Sync {
    fn build(&self, ctx: &ExecCtx, req: &FsImageRequest) -> Result<()>;
}

#[derive(Clone)]
pub struct ToolSet {
    pub boot: Arc<dyn BootImageTool>,
    pub extractor: Arc<dyn SystemExtractor>,
    pub image_builder: Arc<dyn FsImageBuilder>,
}

impl ToolSet {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            boot: Arc::new(CommandBootTool {
                unpack: cfg.boot_unpack.clone(),
                repack: cfg.boot_repack.clone(),
                repacked: cfg.boot_repacked.clone(),
            }),
            extractor: Arc::new(CommandSystemExtractor {
                argv: cfg.system_extract.clone(),
            }),
            image_builder: Arc::new(MakeExt4fs {
                program: cfg.make_ext4fs.clone(),
            }),
        }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

/// Builds a command from an argv template, substituting `{name}` placeholders.
fn command_from_template(argv: &[String], vars: &[(&str, &Path)]) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::config("tool command template is empty"));
    };
    let expand = |raw: &str| {
        let mut s = raw.to_string();
        for (name, value) in vars {
            s = s.replace(&format!("{{{name}}}"), &value.display().to_string());
        }
        s
    };
    let mut cmd = Command::new(expand(program));
    cmd.args(args.iter().map(|a| expand(a)));
    Ok(cmd)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

pub struct CommandBootTool {
    pub unpack: Vec<String>,
    pub repack: Vec<String>,
    pub repacked: String,
}

impl BootImageTool for CommandBootTool {
    fn unpack(&self, ctx: &ExecCtx, image: &Path) -> Result<()> {
        let mut cmd = command_from_template(&self.unpack, &[("image", image)])?;
        cmd.current_dir(parent_dir(image));
        ctx.run_cmd(cmd)
    }

    fn repack(&self, ctx: &ExecCtx, dir: &Path) -> Result<PathBuf> {
        let mut cmd = command_from_template(&self.repack, &[("dir", dir)])?;
        cmd.current_dir(dir);
        ctx.run_cmd(cmd)?;
        let out = dir.join(&self.repacked);
        if !ctx.dry_run && !out.is_file() {
            return Err(Error::external_tool(format!(
                "boot repack did not produce {}",
                out.display()
            )));
        }
        Ok(out)
    }
}

pub struct CommandSystemExtractor {
    pub argv: Vec<String>,
}

impl SystemExtractor for CommandSystemExtractor {
    fn extract(&self, ctx: &ExecCtx, image: &Path, out_dir: &Path) -> Result<()> {
        let mut cmd = command_from_template(&self.argv, &[("image", image), ("out", out_dir)])?;
        cmd.current_dir(parent_dir(out_dir));
        ctx.run_cmd(cmd)
    }
}

pub struct MakeExt4fs {
    pub program: String,
}

impl MakeExt4fs {
    pub fn args(req: &FsImageRequest) -> Vec<String> {
        vec![
            "-J".into(),
            "-T".into(),
            "1".into(),
            "-l".into(),
            req.size.to_string(),
            "-C".into(),
            req.fs_config.display().to_string(),
            "-S".into(),
            req.file_contexts.display().to_string(),
            "-L".into(),
            req.label.clone(),
            "-a".into(),
            req.mount_point.clone(),
            req.output.display().to_string(),
            req.source_dir.display().to_string(),
        ]
    }
}

impl FsImageBuilder for MakeExt4fs {
    fn build(&self, ctx: &ExecCtx, req: &FsImageRequest) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(req));
        ctx.run_cmd(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_substitute_placeholders() {
        let argv = vec![
            "imgextractor".to_string(),
            "{image}".to_string(),
            "--out={out}".to_string(),
        ];
        let cmd = command_from_template(
            &argv,
            &[
                ("image", Path::new("/in/system.img")),
                ("out", Path::new("/base/system")),
            ],
        )
        .expect("command");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "imgextractor");
        assert_eq!(args, ["/in/system.img", "--out=/base/system"]);
    }

    #[test]
    fn empty_template_is_a_config_error() {
        let err = command_from_template(&[], &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn make_ext4fs_argument_layout() {
        let req = FsImageRequest {
            size: 4096,
            fs_config: "cfg/fs".into(),
            file_contexts: "cfg/fc".into(),
            label: "system".into(),
            mount_point: "system".into(),
            output: "out/system.img".into(),
            source_dir: "rom/system".into(),
        };
        assert_eq!(
            MakeExt4fs::args(&req),
            [
                "-J", "-T", "1", "-l", "4096", "-C", "cfg/fs", "-S", "cfg/fc", "-L", "system",
                "-a", "system", "out/system.img", "rom/system"
            ]
        );
    }
}
