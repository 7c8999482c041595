use porttool_macros::{Module, Task};

use crate::archive;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::profile::PortProfile;

#[Task(
    id = "rom.unpack",
    module = "rom",
    phase = "unpack",
    after = ["workspace:ready"],
    provides = ["rom:unpacked"],
    default_label = "Unpack port package"
)]
pub struct UnpackTask;

impl UnpackTask {
    fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(profile)?;
        let inputs = util::input_paths(profile, ctx)?;
        let rom = ws.rom_dir();

        util::reset_dir(&rom)?;
        ctx.log(&format!(
            "extracting {} -> {}",
            inputs.port_zip.display(),
            rom.display()
        ));
        let n = archive::extract_all(&inputs.port_zip, &rom)?;
        ctx.log(&format!("extracted {n} entries"));

        util::write_json_pretty(
            &ws.manifests_dir().join("rom.json"),
            &serde_json::json!({
                "task": Self::ID,
                "port_zip": inputs.port_zip.display().to_string(),
                "rom_dir": rom.display().to_string(),
                "entries": n,
            }),
        )
    }
}

#[Module(id = "rom", tasks = [UnpackTask])]
pub struct RomModule;
