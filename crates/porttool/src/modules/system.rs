use std::path::Path;

use porttool_macros::{Module, Task};

use crate::cache::SystemCache;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::profile::{PortProfile, SystemOp};
use crate::props::{self, PropFile};

pub const DENSITY_PROP: &str = "ro.sf.lcd_density";

#[Task(
    id = "system.port",
    module = "system",
    phase = "port",
    after = ["boot:patched"],
    provides = ["system:patched"],
    default_label = "Port system tree"
)]
pub struct PortTask;

impl PortTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(profile)?;
        let inputs = util::input_paths(profile, ctx)?;

        let cache = SystemCache::new(&ws.cache_dir);
        let extractor = ctx.tools.extractor.clone();
        let unpacked = cache.ensure_unpacked(ctx, &inputs.base_system, extractor.as_ref())?;

        let base_root = cache.tree_dir();
        let port_root = ws.rom_dir().join("system");

        let mut applied = Vec::new();
        for op in profile.system_ops() {
            applied.extend(apply_op(ctx, op, &base_root, &port_root)?);
        }

        util::write_json_pretty(
            &ws.manifests_dir().join("system.json"),
            &serde_json::json!({
                "task": Self::ID,
                "base_system": inputs.base_system.display().to_string(),
                "unpacked": unpacked,
                "cache_digest": cache.recorded(),
                "applied": applied,
            }),
        )
    }
}

/// Applies one operation from the base system tree onto the port one and
/// returns a label per change made.
pub fn apply_op(
    ctx: &ExecCtx,
    op: &SystemOp,
    base_root: &Path,
    port_root: &Path,
) -> Result<Vec<String>> {
    let base_prop = base_root.join("build.prop");
    let port_prop = port_root.join("build.prop");
    let mut applied = Vec::new();
    match op {
        SystemOp::Replace { category, paths } => {
            for rel in paths {
                let src = base_root.join(rel);
                let dst = port_root.join(rel);
                if util::replace_path(&src, &dst)? {
                    ctx.log(&format!("replace $base/{rel} -> $port/{rel}"));
                    applied.push(format!("replace_{category}:{rel}"));
                } else {
                    ctx.warn(&format!("{rel} not found in base system; skipped"));
                }
            }
        }
        SystemOp::SimSlots(slots) => {
            ctx.log(&format!("configuring {slots:?} sim slots"));
            props::edit(&port_prop, |p| {
                for (k, v) in slots.props() {
                    p.set(k, v);
                }
                Ok(())
            })?;
            applied.push(format!("sim:{slots:?}"));
        }
        SystemOp::FitDensity => {
            copy_props(ctx, &base_prop, &port_prop, &[DENSITY_PROP])?;
            applied.push("fit_density".into());
        }
        SystemOp::CopyIdentity(kind) => {
            copy_props(ctx, &base_prop, &port_prop, kind.keys())?;
            applied.push(format!("identity:{kind:?}"));
        }
    }
    Ok(applied)
}

/// Copies `keys` from the base build.prop into the port one. Keys missing
/// from base are written empty.
pub fn copy_props(ctx: &ExecCtx, base: &Path, port: &Path, keys: &[&str]) -> Result<()> {
    let base = PropFile::read_only(base)?;
    props::edit(port, |p| {
        for key in keys {
            let value = base.get(key).unwrap_or_else(|| {
                ctx.warn(&format!("{key} not set in base build.prop"));
                String::new()
            });
            ctx.log(&format!("build.prop [{key}] = [{value}]"));
            p.set(key, &value);
        }
        Ok(())
    })
}

#[Module(id = "system", tasks = [PortTask])]
pub struct SystemModule;
