use crate::error::Result;
use crate::planner::Plan;
use crate::profile::PortProfile;

pub mod boot;
pub mod core;
pub mod package;
pub mod rom;
pub mod system;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, profile: &PortProfile) -> bool;
    fn plan(&self, profile: &PortProfile, plan: &mut Plan) -> Result<()>;
}

/// Modules in pipeline order.
pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(rom::RomModule),
        Box::new(boot::BootModule),
        Box::new(system::SystemModule),
        Box::new(package::PackageModule),
    ]
}
