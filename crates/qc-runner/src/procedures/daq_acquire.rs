use crate::capability::{Capabilities, CapabilityKind};
use crate::contract::{ArgDecl, BoundArguments, InterfaceDecl, TaskType};
use crate::procedure::{Procedure, ProcedureContext};
use crate::validate::Range;
use anyhow::Result;
use qc_core::{DataEntry, SingularResult};
use qc_hw::Endpoint;

pub const NAME: &str = "daq_acquire";

pub fn task() -> Result<TaskType> {
    Ok(TaskType {
        name: NAME,
        doc: "Acquire a fixed number of events from the tileboard and snapshot the slow-control configuration.",
        arguments: vec![ArgDecl::int("n_events", "Number of events to collect")
            .with_default(1000)
            .validate(Range::new(1.0, 100_000.0)?)],
        interfaces: vec![InterfaceDecl::capability("tbc", CapabilityKind::Controller)],
        build,
    })
}

fn build(args: &BoundArguments) -> Result<Box<dyn Procedure>> {
    Ok(Box::new(DaqAcquire {
        n_events: args.int("n_events")? as u64,
    }))
}

struct DaqAcquire {
    n_events: u64,
}

impl Procedure for DaqAcquire {
    fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()> {
        let ctl = caps.controller()?;
        ctx.log_info(format!("Acquiring {} events", self.n_events));
        ctx.acquire(
            ctl,
            self.n_events,
            DataEntry::new("daq_acquire.json", "Data acquisition").with("n_events", self.n_events),
        )?;

        let snapshot = ctl.config(Endpoint::SlowControl).clone();
        ctx.write_json("slow_control_config.json", &snapshot)?;
        ctx.record_data(DataEntry::new(
            "slow_control_config.json",
            "Slow control configuration",
        ));

        ctx.set_board_summary(SingularResult::board(0, "SUCCESS").with("n_events", self.n_events))
    }
}
