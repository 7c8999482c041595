#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use porttool::archive;
use porttool::config::ConfigDoc;
use porttool::executor::{ChannelSink, ExecCtx, ExecEvent};
use porttool::profile::PortProfile;
use porttool::tools::{BootImageTool, FsImageBuilder, FsImageRequest, SystemExtractor, ToolSet};
use porttool::Result;

pub const UPDATER_SCRIPT: &str = r#"ui_print("Installing");
mount("ext4", "EMMC", "/dev/block/system", "/system");
package_extract_dir("system", "/system");
symlink("toolbox", "/system/bin/ls");
set_metadata_recursive("/system/bin", "uid", 0, "gid", 2000, "dmode", 0755, "fmode", 0755,
    "capabilities", 0x0, "selabel", "u:object_r:system_file:s0");
unmount("/system");
"#;

/// Boot "containers" in these tests are plain zips of the unpacked tree.
pub struct ZipBootTool;

impl BootImageTool for ZipBootTool {
    fn unpack(&self, _ctx: &ExecCtx, image: &Path) -> Result<()> {
        let dir = image.parent().unwrap_or_else(|| Path::new("."));
        archive::extract_all(image, dir)?;
        Ok(())
    }

    fn repack(&self, _ctx: &ExecCtx, dir: &Path) -> Result<PathBuf> {
        let tmp = dir.with_extension("repack.zip");
        archive::compress_dir(dir, &tmp)?;
        let out = dir.join("boot-new.img");
        fs::rename(&tmp, &out)?;
        Ok(out)
    }
}

/// System images are zips too; counts how often it had to unpack.
#[derive(Default)]
pub struct ZipExtractor {
    pub runs: AtomicUsize,
}

impl ZipExtractor {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl SystemExtractor for ZipExtractor {
    fn extract(&self, _ctx: &ExecCtx, image: &Path, out_dir: &Path) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        archive::extract_all(image, out_dir)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingImageBuilder {
    pub requests: Mutex<Vec<FsImageRequest>>,
}

impl FsImageBuilder for RecordingImageBuilder {
    fn build(&self, _ctx: &ExecCtx, req: &FsImageRequest) -> Result<()> {
        fs::write(&req.output, b"EXT4")?;
        self.requests
            .lock()
            .map_err(|_| porttool::Error::msg("poisoned"))?
            .push(req.clone());
        Ok(())
    }
}

pub struct Fakes {
    pub extractor: Arc<ZipExtractor>,
    pub builder: Arc<RecordingImageBuilder>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            extractor: Arc::new(ZipExtractor::default()),
            builder: Arc::new(RecordingImageBuilder::default()),
        }
    }

    pub fn tools(&self) -> ToolSet {
        ToolSet {
            boot: Arc::new(ZipBootTool),
            extractor: self.extractor.clone(),
            image_builder: self.builder.clone(),
        }
    }
}

pub fn write(path: &Path, body: impl AsRef<[u8]>) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, body).expect("write");
}

/// Lays out base images, a donor package and a profile under `root`.
pub struct Fixture {
    pub root: PathBuf,
}

impl Fixture {
    pub fn new(root: &Path, with_donor_boot: bool) -> Self {
        let src = root.join("src");

        let base_boot = src.join("base-boot");
        write(&base_boot.join("kernel"), "BASE-KERNEL");
        write(&base_boot.join("fstab.mt6580"), "BASE-FSTAB");
        write(&base_boot.join("bootinfo.txt"), "base:0x10000000\ncmdline:bootopt=64S3,32N2\n");
        write(&base_boot.join("initrd/default.prop"), "ro.secure=1\n");
        archive::compress_dir(&base_boot, &root.join("inputs/boot.img")).expect("base boot");

        let base_system = src.join("base-system");
        write(
            &base_system.join("build.prop"),
            "ro.product.model=BaseModel\nro.sf.lcd_density=320\npersist.sys.timezone=Asia/Shanghai\n",
        );
        write(&base_system.join("etc/firmware/fw.bin"), "BASE-FW");
        archive::compress_dir(&base_system, &root.join("inputs/system.img")).expect("base system");

        let port_boot = src.join("port-boot");
        write(&port_boot.join("kernel"), "PORT-KERNEL");
        write(&port_boot.join("fstab.mt6580"), "PORT-FSTAB");
        write(&port_boot.join("bootinfo.txt"), "base:0x10000000\ncmdline:console=ttyS0\n");
        write(&port_boot.join("initrd/default.prop"), "ro.secure=1\nro.debuggable=0\n");

        let rom = src.join("rom");
        if with_donor_boot {
            archive::compress_dir(&port_boot, &rom.join("boot.img")).expect("port boot");
        }
        write(
            &rom.join("system/build.prop"),
            "ro.product.model=DonorModel\nro.sf.lcd_density=480\npersist.sys.timezone=UTC\n",
        );
        write(&rom.join("system/bin/app_process"), "\x7fELF");
        write(&rom.join("system/etc/hosts"), "127.0.0.1 localhost\n");
        write(&rom.join("system/etc/firmware/stale.bin"), "PORT-FW");
        write(&rom.join("META-INF/com/google/android/updater-script"), UPDATER_SCRIPT);
        write(&rom.join("META-INF/com/google/android/update-binary"), "donor-binary");
        archive::compress_dir(&rom, &root.join("inputs/port.zip")).expect("port zip");

        write(&root.join("bin/update-binary"), "bundled-binary");
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn profile_toml(&self, output: &str) -> String {
        format!(
            r#"
[profile]
name = "mt6580"

[inputs]
base_boot = "inputs/boot.img"
base_system = "inputs/system.img"
port_zip = "inputs/port.zip"

[output]
kind = "{output}"

[flags]
replace_kernel = true
replace_fstab = true
selinux_permissive = true
enable_adb = true
replace_firmware = true
dual_simcard = true
fit_density = true
change_timezone = true
change_model = false
use_custom_update-binary = true

[replace]
kernel = ["kernel"]
fstab = ["fstab.mt6580", "fstab.missing"]
firmware = ["etc/firmware"]

[workspace]
root_dir = "{root}"
"#,
            root = self.root.display().to_string().replace('\\', "/"),
        )
    }

    pub fn profile(&self, output: &str) -> PortProfile {
        let doc = ConfigDoc::parse(self.root.join("mt6580.toml"), &self.profile_toml(output))
            .expect("parse profile");
        PortProfile::from_doc(&doc).expect("profile")
    }

    pub fn build(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn out(&self) -> PathBuf {
        self.root.join("out")
    }
}

pub fn channel_ctx(tools: ToolSet) -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    (
        ExecCtx::new(false, Arc::new(ChannelSink::new(tx))).with_tools(tools),
        rx,
    )
}

pub fn extract(zip: &Path, dir: &Path) -> PathBuf {
    archive::extract_all(zip, dir).expect("extract");
    dir.to_path_buf()
}
