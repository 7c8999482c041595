//! Boot component: stage base and donor images, unpack both, patch the donor
//! tree, repack it over the donor package's `boot.img`.

use std::fs;
use std::path::{Path, PathBuf};

use porttool_macros::{Module, Task};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::profile::{BootOp, PortProfile};
use crate::props;

pub const PERMISSIVE_TOKEN: &str = "androidboot.selinux=permissive";

pub const ADB_PROPS: [(&str, &str); 4] = [
    ("ro.secure", "0"),
    ("ro.adb.secure", "0"),
    ("ro.debuggable", "1"),
    ("persist.sys.usb.config", "mtp,adb"),
];

#[Task(
    id = "boot.port",
    module = "boot",
    phase = "port",
    after = ["rom:unpacked"],
    provides = ["boot:patched"],
    default_label = "Port boot image"
)]
pub struct PortTask;

impl PortTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(profile)?;
        let inputs = util::input_paths(profile, ctx)?;
        let staging = ws.boot_staging_dir();
        let base_dir = staging.join("base");
        let port_dir = staging.join("port");

        let donor_boot = ws.rom_dir().join("boot.img");
        if !donor_boot.is_file() {
            return Err(Error::not_found("boot.img in port package root", &donor_boot));
        }
        if !inputs.base_boot.is_file() {
            return Err(Error::not_found("base boot image", &inputs.base_boot));
        }

        util::reset_dir(&base_dir)?;
        util::reset_dir(&port_dir)?;
        let base_img = base_dir.join("boot.img");
        let port_img = port_dir.join("boot.img");
        util::copy_file(&inputs.base_boot, &base_img)?;
        util::copy_file(&donor_boot, &port_img)?;

        let tool = ctx.tools.boot.clone();
        ctx.log("unpacking base and port boot images");
        tool.unpack(ctx, &base_img)?;
        tool.unpack(ctx, &port_img)?;

        let mut applied = Vec::new();
        for op in profile.boot_ops() {
            match op {
                BootOp::ReplaceKernel(paths) | BootOp::ReplaceFstab(paths) => {
                    for rel in paths {
                        if replace_from_base(ctx, &base_dir, &port_dir, rel)? {
                            applied.push(format!("replace:{rel}"));
                        }
                    }
                }
                BootOp::SelinuxPermissive => {
                    let info = port_dir.join(&profile.boot.info_file);
                    if !info.is_file() {
                        ctx.warn(&format!("{} missing; selinux unchanged", info.display()));
                    } else if ensure_selinux_permissive(&info)? {
                        ctx.log("selinux set to permissive");
                        applied.push("selinux_permissive".into());
                    } else {
                        ctx.log("selinux already permissive");
                    }
                }
                BootOp::EnableAdb => {
                    let prop = port_dir.join(&profile.boot.default_prop);
                    if !prop.is_file() {
                        ctx.warn(&format!("{} missing; adb unchanged", prop.display()));
                        continue;
                    }
                    ctx.log("enabling adb and debugging");
                    props::edit(&prop, |p| {
                        for (k, v) in ADB_PROPS {
                            p.set(k, v);
                        }
                        Ok(())
                    })?;
                    applied.push("enable_adb".into());
                }
            }
        }

        ctx.log("repacking port boot image");
        let repacked = tool.repack(ctx, &port_dir)?;
        util::copy_file(&repacked, &donor_boot)?;
        ctx.log(&format!("{} -> {}", repacked.display(), donor_boot.display()));

        util::write_json_pretty(
            &ws.manifests_dir().join("boot.json"),
            &serde_json::json!({
                "task": Self::ID,
                "base_boot": inputs.base_boot.display().to_string(),
                "repacked": repacked.display().to_string(),
                "applied": applied,
            }),
        )
    }
}

/// Byte-copies `rel` from the base staging tree over the port one.
fn replace_from_base(ctx: &ExecCtx, base_dir: &Path, port_dir: &Path, rel: &str) -> Result<bool> {
    let src = base_dir.join(rel);
    let dst: PathBuf = port_dir.join(rel);
    if !src.exists() {
        ctx.warn(&format!("{rel} not present in base boot image; skipped"));
        return Ok(false);
    }
    ctx.log(&format!("replace {} -> {}", src.display(), dst.display()));
    util::replace_path(&src, &dst)
}

/// Appends the permissive token to the `cmdline:` line unless already present.
///
/// Returns whether the file changed.
pub fn ensure_selinux_permissive(info: &Path) -> Result<bool> {
    let raw = fs::read_to_string(info)?;
    if raw.contains(PERMISSIVE_TOKEN) {
        return Ok(false);
    }
    let mut changed = false;
    let mut out = String::with_capacity(raw.len() + PERMISSIVE_TOKEN.len() + 1);
    for line in raw.lines() {
        let line = line.trim_end();
        out.push_str(line);
        if line.starts_with("cmdline:") {
            out.push(' ');
            out.push_str(PERMISSIVE_TOKEN);
            changed = true;
        }
        out.push('\n');
    }
    if changed {
        fs::write(info, out)?;
    }
    Ok(changed)
}

#[Module(id = "boot", tasks = [PortTask])]
pub struct BootModule;
