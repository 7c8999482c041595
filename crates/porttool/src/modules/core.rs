use porttool_macros::{Module, Task};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::profile::PortProfile;

#[Task(
    id = "core.init",
    module = "core",
    phase = "init",
    provides = ["workspace:ready"],
    default_label = "Init workspace"
)]
pub struct InitTask;

impl InitTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = &profile.workspace;
        ctx.log(&format!("profile = {}", profile.name()));
        ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
        ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
        ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
        ctx.log(&format!("workspace.cache_dir = {}", ws.cache_dir));
        ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

        let paths = crate::workspace::init_dirs(ws)?;
        ctx.set_workspace_paths(paths.clone());
        for (name, path) in &paths.named_dirs {
            ctx.log(&format!("workspace.paths.{name} = {}", path.display()));
        }

        let meta = &profile.meta;
        ctx.log(&format!("target_arch = {}", meta.target_arch.as_str()));
        ctx.log(&format!("output.kind = {}", profile.output.kind.as_str()));
        if meta.patch_magisk {
            match meta.magisk_apk.as_deref().map(|p| paths.resolve_config_path(p)) {
                Some(Ok(apk)) if apk.is_file() => {
                    ctx.log(&format!("magisk_apk = {}", apk.display()))
                }
                Some(Ok(apk)) => ctx.warn(&format!("magisk_apk not found: {}", apk.display())),
                Some(Err(e)) => return Err(e),
                None => ctx.warn("patch_magisk is set but magisk_apk is not"),
            }
        }

        let inputs = util::input_paths(profile, ctx)?;
        for (what, p) in [
            ("base boot image", &inputs.base_boot),
            ("base system image", &inputs.base_system),
            ("port package", &inputs.port_zip),
        ] {
            if !p.is_file() {
                return Err(Error::not_found(what, p));
            }
            ctx.log(&format!("{what} = {}", p.display()));
        }
        Ok(())
    }
}

#[Module(id = "core", tasks = [InitTask])]
pub struct CoreModule;
