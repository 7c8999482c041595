use std::fs;

use porttool_macros::{Module, Task};

use crate::archive;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::metadata;
use crate::modules::util;
use crate::profile::{PackageOp, PortProfile};
use crate::tools::FsImageRequest;

pub const SCRIPT_DIR: &str = "META-INF/com/google/android";

/// Larger of the base image size and 1.2x the tree's file bytes, rounded up.
pub fn image_size(base_image_len: u64, tree_bytes: u64) -> u64 {
    let fit = (u128::from(tree_bytes) * 12).div_ceil(10);
    base_image_len.max(u64::try_from(fit).unwrap_or(u64::MAX))
}

#[Task(
    id = "package.zip",
    module = "package",
    phase = "assemble",
    after = ["system:patched"],
    provides = ["package:done"],
    default_label = "Assemble flashable zip",
    when = PortProfile::wants_zip
)]
pub struct ZipTask;

impl ZipTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(profile)?;
        let inputs = util::input_paths(profile, ctx)?;
        let rom = ws.rom_dir();

        for op in profile.package_ops() {
            match op {
                PackageOp::CustomUpdateBinary => {
                    let src = ws.resolve_config_path(&profile.output.update_binary)?;
                    if !src.is_file() {
                        return Err(Error::not_found("bundled update-binary", &src));
                    }
                    ctx.log("using bundled update-binary");
                    util::copy_file(&src, &rom.join(SCRIPT_DIR).join("update-binary"))?;
                }
            }
        }

        let name = inputs
            .port_zip
            .file_name()
            .ok_or_else(|| Error::config("inputs.port_zip has no file name"))?;
        let out = ws.out_dir.join(name);
        ctx.log(&format!("compressing {} -> {}", rom.display(), out.display()));
        let entries = archive::compress_dir(&rom, &out)?;
        ctx.log(&format!("wrote {entries} entries"));

        util::write_json_pretty(
            &ws.manifests_dir().join("package.json"),
            &serde_json::json!({
                "task": Self::ID,
                "output": out.display().to_string(),
                "entries": entries,
            }),
        )
    }
}

#[Task(
    id = "package.image",
    module = "package",
    phase = "assemble",
    after = ["system:patched"],
    provides = ["package:done"],
    default_label = "Build system image",
    when = PortProfile::wants_image
)]
pub struct ImageTask;

impl ImageTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(profile)?;
        let inputs = util::input_paths(profile, ctx)?;
        let rom = ws.rom_dir();

        if profile.package_ops().next().is_some() {
            ctx.log("update-binary override only applies to zip output; ignored");
        }

        let updater = rom.join(SCRIPT_DIR).join("updater-script");
        if !updater.is_file() {
            return Err(Error::not_found("updater-script", &updater));
        }
        let script = String::from_utf8_lossy(&fs::read(&updater)?).into_owned();

        let tables = metadata::synthesize(ctx, &rom, Some(&script))?;
        let config_dir = ws.metadata_dir();
        util::reset_dir(&config_dir)?;
        let (fs_config, file_contexts) = tables.write(&config_dir)?;

        let base_len = fs::metadata(&inputs.base_system)
            .map_err(|e| Error::from(e).context("base system image"))?
            .len();
        let system_dir = rom.join("system");
        let tree_bytes = util::tree_size(&system_dir)?;
        let size = image_size(base_len, tree_bytes);
        ctx.log(&format!(
            "image size {size} (base {base_len}, tree {tree_bytes})"
        ));

        let req = FsImageRequest {
            size,
            fs_config,
            file_contexts,
            label: "system".into(),
            mount_point: "system".into(),
            output: ws.out_dir.join("system.img"),
            source_dir: system_dir,
        };
        let builder = ctx.tools.image_builder.clone();
        builder.build(ctx, &req)?;

        let boot_out = ws.out_dir.join("boot.img");
        util::copy_file(&rom.join("boot.img"), &boot_out)?;

        util::write_json_pretty(
            &ws.manifests_dir().join("package.json"),
            &serde_json::json!({
                "task": Self::ID,
                "system_image": req.output.display().to_string(),
                "boot_image": boot_out.display().to_string(),
                "size": size,
                "fs_config_rows": tables.fs.len(),
                "file_contexts_rows": tables.fc.len(),
            }),
        )
    }
}

#[Module(id = "package", tasks = [ZipTask, ImageTask])]
pub struct PackageModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_keeps_margin_or_base() {
        assert_eq!(image_size(0, 100), 120);
        assert_eq!(image_size(0, 101), 122);
        assert_eq!(image_size(1000, 100), 1000);
        assert_eq!(image_size(0, 0), 0);
    }
}
