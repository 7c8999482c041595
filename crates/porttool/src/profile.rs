//! Chipset port profile: which operations run and what they copy.
//!
//! A profile is decoded once per run from a [`ConfigDoc`] and is not mutated
//! afterwards. Every enabled flag is resolved into a [`PortOp`] up front, so
//! stages dispatch over a closed set of operations instead of flag strings.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::workspace::WorkspaceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TargetArch {
    #[default]
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "armeabi-v7a")]
    ArmeabiV7a,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl TargetArch {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetArch::Arm64V8a => "arm64-v8a",
            TargetArch::ArmeabiV7a => "armeabi-v7a",
            TargetArch::X86 => "x86",
            TargetArch::X86_64 => "x86_64",
        }
    }
}

/// Free-form extras collected alongside the flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileMeta {
    pub name: Option<String>,
    pub target_arch: TargetArch,
    pub patch_magisk: bool,
    pub magisk_apk: Option<String>,
}

impl Default for ProfileMeta {
    fn default() -> Self {
        Self {
            name: None,
            target_arch: TargetArch::default(),
            patch_magisk: false,
            magisk_apk: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortInputs {
    pub base_boot: String,
    pub base_system: String,
    pub port_zip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    /// Repackaged flashable archive.
    #[default]
    Zip,
    /// Freshly built system image plus the patched boot image.
    Image,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Zip => "zip",
            OutputKind::Image => "image",
        }
    }
}

fn default_update_binary() -> String {
    "bin/update-binary".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    #[serde(default = "default_update_binary")]
    pub update_binary: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Zip,
            update_binary: default_update_binary(),
        }
    }
}

/// File names produced by the boot unpack collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootLayout {
    pub info_file: String,
    pub default_prop: String,
}

impl Default for BootLayout {
    fn default() -> Self {
        Self {
            info_file: "bootinfo.txt".into(),
            default_prop: "initrd/default.prop".into(),
        }
    }
}

/// Argv templates for the external collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Run inside the image's directory; `{image}` is the container path.
    pub boot_unpack: Vec<String>,
    /// Run inside the unpacked directory; `{dir}` is that directory.
    pub boot_repack: Vec<String>,
    /// File name the repack step leaves in the unpacked directory.
    pub boot_repacked: String,
    /// `{image}` and `{out}` are substituted.
    pub system_extract: Vec<String>,
    pub make_ext4fs: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            boot_unpack: vec!["bootimg".into(), "unpack".into(), "{image}".into()],
            boot_repack: vec!["bootimg".into(), "repack".into(), "{dir}".into()],
            boot_repacked: "boot-new.img".into(),
            system_extract: vec!["imgextractor".into(), "{image}".into(), "{out}".into()],
            make_ext4fs: "make_ext4fs".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSlots {
    Single,
    Dual,
}

impl SimSlots {
    /// The five telephony properties that must agree with each other.
    pub fn props(self) -> [(&'static str, &'static str); 5] {
        let single = self == SimSlots::Single;
        let multisim = if single { "ss" } else { "dsds" };
        [
            ("persist.multisim.config", multisim),
            ("persist.radio.multisim.config", multisim),
            ("ro.telephony.sim.count", if single { "1" } else { "2" }),
            ("persist.dsds.enabled", if single { "false" } else { "true" }),
            ("ro.dual.sim.phone", if single { "false" } else { "true" }),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityProps {
    Timezone,
    Locale,
    Model,
}

impl IdentityProps {
    pub fn keys(self) -> &'static [&'static str] {
        match self {
            IdentityProps::Timezone => &["persist.sys.timezone"],
            IdentityProps::Locale => &["ro.product.locale"],
            IdentityProps::Model => &[
                "ro.product.manufacturer",
                "ro.build.product",
                "ro.product.model",
                "ro.product.device",
                "ro.product.board",
                "ro.product.brand",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOp {
    ReplaceKernel(Vec<String>),
    ReplaceFstab(Vec<String>),
    SelinuxPermissive,
    EnableAdb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemOp {
    Replace { category: String, paths: Vec<String> },
    SimSlots(SimSlots),
    FitDensity,
    CopyIdentity(IdentityProps),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOp {
    CustomUpdateBinary,
}

/// One enabled profile operation, grouped by the stage that applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOp {
    Boot(BootOp),
    System(SystemOp),
    Package(PackageOp),
}

impl PortOp {
    /// Resolves a flag name against the profile's replace lists.
    pub fn from_flag(name: &str, replace: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let paths_for = |category: &str| {
            replace.get(category).cloned().ok_or_else(|| {
                Error::config(format!(
                    "flag '{name}' is enabled but [replace].{category} is not defined"
                ))
            })
        };
        let op = match name {
            "replace_kernel" => PortOp::Boot(BootOp::ReplaceKernel(paths_for("kernel")?)),
            "replace_fstab" => PortOp::Boot(BootOp::ReplaceFstab(paths_for("fstab")?)),
            "selinux_permissive" => PortOp::Boot(BootOp::SelinuxPermissive),
            "enable_adb" => PortOp::Boot(BootOp::EnableAdb),
            "single_simcard" => PortOp::System(SystemOp::SimSlots(SimSlots::Single)),
            "dual_simcard" => PortOp::System(SystemOp::SimSlots(SimSlots::Dual)),
            "fit_density" => PortOp::System(SystemOp::FitDensity),
            "change_timezone" => PortOp::System(SystemOp::CopyIdentity(IdentityProps::Timezone)),
            "change_locale" => PortOp::System(SystemOp::CopyIdentity(IdentityProps::Locale)),
            "change_model" => PortOp::System(SystemOp::CopyIdentity(IdentityProps::Model)),
            "use_custom_update-binary" => PortOp::Package(PackageOp::CustomUpdateBinary),
            other => match other.strip_prefix("replace_") {
                Some(category) if !category.is_empty() => PortOp::System(SystemOp::Replace {
                    category: category.to_string(),
                    paths: paths_for(category)?,
                }),
                _ => return Err(Error::config(format!("unknown port flag '{other}'"))),
            },
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortProfile {
    pub meta: ProfileMeta,
    pub inputs: PortInputs,
    pub output: OutputConfig,
    /// Flag name to enabled, in profile order.
    pub flags: Vec<(String, bool)>,
    pub replace: BTreeMap<String, Vec<String>>,
    pub boot: BootLayout,
    pub tools: ToolsConfig,
    pub workspace: WorkspaceConfig,
    ops: Vec<PortOp>,
}

impl PortProfile {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let mut flags = Vec::new();
        if let Some(tbl) = doc.table_path("flags") {
            for (name, v) in tbl {
                let Some(enabled) = v.as_bool() else {
                    return Err(Error::config(format!(
                        "flags.{name} must be a boolean"
                    )));
                };
                flags.push((name.clone(), enabled));
            }
        }
        let replace: BTreeMap<String, Vec<String>> =
            doc.deserialize_path("replace")?.unwrap_or_default();

        let mut profile = Self {
            meta: doc.deserialize_path("profile")?.unwrap_or_default(),
            inputs: doc.deserialize_path("inputs")?.unwrap_or_default(),
            output: doc.deserialize_path("output")?.unwrap_or_default(),
            flags,
            replace,
            boot: doc.deserialize_path("boot")?.unwrap_or_default(),
            tools: doc.deserialize_path("tools")?.unwrap_or_default(),
            workspace: doc.deserialize_path("workspace")?.unwrap_or_default(),
            ops: Vec::new(),
        };
        if profile.meta.name.is_none() {
            profile.meta.name = doc
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(ToOwned::to_owned);
        }
        profile.ops = profile
            .flags
            .iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(name, _)| PortOp::from_flag(name, &profile.replace))
            .collect::<Result<Vec<_>>>()?;
        Ok(profile)
    }

    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or("port")
    }

    pub fn ops(&self) -> &[PortOp] {
        &self.ops
    }

    pub fn boot_ops(&self) -> impl Iterator<Item = &BootOp> {
        self.ops.iter().filter_map(|op| match op {
            PortOp::Boot(b) => Some(b),
            _ => None,
        })
    }

    pub fn system_ops(&self) -> impl Iterator<Item = &SystemOp> {
        self.ops.iter().filter_map(|op| match op {
            PortOp::System(s) => Some(s),
            _ => None,
        })
    }

    pub fn package_ops(&self) -> impl Iterator<Item = &PackageOp> {
        self.ops.iter().filter_map(|op| match op {
            PortOp::Package(p) => Some(p),
            _ => None,
        })
    }

    pub fn wants_image(&self) -> bool {
        self.output.kind == OutputKind::Image
    }

    pub fn wants_zip(&self) -> bool {
        self.output.kind == OutputKind::Zip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(raw: &str) -> Result<PortProfile> {
        PortProfile::from_doc(&ConfigDoc::parse("mt65.toml", raw)?)
    }

    #[test]
    fn flags_keep_profile_order_and_skip_disabled() {
        let p = profile(
            r#"
[flags]
selinux_permissive = true
replace_kernel = false
enable_adb = true
replace_firmware = true
fit_density = true

[replace]
kernel = ["kernel"]
firmware = ["etc/firmware"]
"#,
        )
        .expect("profile");

        let names: Vec<&str> = p.flags.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "selinux_permissive",
                "replace_kernel",
                "enable_adb",
                "replace_firmware",
                "fit_density"
            ]
        );
        assert_eq!(
            p.ops(),
            [
                PortOp::Boot(BootOp::SelinuxPermissive),
                PortOp::Boot(BootOp::EnableAdb),
                PortOp::System(SystemOp::Replace {
                    category: "firmware".into(),
                    paths: vec!["etc/firmware".into()],
                }),
                PortOp::System(SystemOp::FitDensity),
            ]
        );
        assert_eq!(p.name(), "mt65");
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let err = profile("[flags]\nmake_coffee = true\n").unwrap_err();
        assert!(err.to_string().contains("make_coffee"), "unexpected err: {err}");
    }

    #[test]
    fn enabled_replace_without_list_is_rejected() {
        let err = profile("[flags]\nreplace_fstab = true\n").unwrap_err();
        assert!(err.to_string().contains("[replace].fstab"), "unexpected err: {err}");
    }

    #[test]
    fn disabled_replace_without_list_is_fine() {
        let p = profile("[flags]\nreplace_fstab = false\n").expect("profile");
        assert!(p.ops().is_empty());
    }

    #[test]
    fn sim_slot_props_are_consistent() {
        let single = SimSlots::Single.props();
        let dual = SimSlots::Dual.props();
        assert_eq!(single[2], ("ro.telephony.sim.count", "1"));
        assert_eq!(dual[0], ("persist.multisim.config", "dsds"));
        assert_eq!(dual[4], ("ro.dual.sim.phone", "true"));
    }

    #[test]
    fn extras_and_output_decode() {
        let p = profile(
            r#"
[profile]
name = "mt6580"
target_arch = "armeabi-v7a"
patch_magisk = true

[output]
kind = "image"
"#,
        )
        .expect("profile");
        assert_eq!(p.meta.target_arch, TargetArch::ArmeabiV7a);
        assert!(p.meta.patch_magisk);
        assert!(p.wants_image());
        assert_eq!(p.name(), "mt6580");
    }
}
