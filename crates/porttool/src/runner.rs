//! Whole-pipeline entry points.

use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::executor::{self, ChannelSink, ExecCtx, ExecEvent};
use crate::modules::builtin_modules;
use crate::planner::Plan;
use crate::profile::PortProfile;
use crate::tools::ToolSet;

pub fn build_plan(profile: &PortProfile) -> Result<Plan> {
    let mut plan = Plan::default();
    for module in builtin_modules() {
        if module.detect(profile) {
            module.plan(profile, &mut plan)?;
        }
    }
    Ok(plan)
}

/// Plans and runs the pipeline on the calling thread.
pub fn run(profile: &PortProfile, ctx: &mut ExecCtx) -> Result<()> {
    let plan = build_plan(profile)?;
    let reg = executor::builtin_registry()?;
    executor::execute_plan(profile, &plan, &reg, ctx)
}

/// A pipeline running on its own worker thread.
pub struct PipelineHandle {
    pub events: mpsc::Receiver<ExecEvent>,
    thread: JoinHandle<Result<()>>,
}

impl PipelineHandle {
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| Error::msg("pipeline worker panicked"))?
    }
}

/// Runs the pipeline on one background thread, streaming events back.
///
/// Only one pipeline should run against a workspace at a time.
pub fn spawn(profile: PortProfile, tools: ToolSet, dry_run: bool) -> PipelineHandle {
    let (tx, rx) = mpsc::channel::<ExecEvent>();
    let thread = std::thread::spawn(move || {
        let sink = Arc::new(ChannelSink::new(tx));
        let mut ctx = ExecCtx::new(dry_run, sink).with_tools(tools);
        run(&profile, &mut ctx)
    });
    PipelineHandle { events: rx, thread }
}
