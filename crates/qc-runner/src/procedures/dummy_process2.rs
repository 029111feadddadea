use super::dummy_procedure::{self, N_CHANNELS};
use crate::capability::{Capabilities, CapabilityKind};
use crate::contract::{ArgDecl, BoundArguments, InterfaceDecl, TaskType};
use crate::procedure::{Procedure, ProcedureContext};
use crate::validate::{Choices, Range};
use anyhow::{anyhow, Result};
use qc_core::SingularResult;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

pub const NAME: &str = "dummy_process2";

pub fn task() -> Result<TaskType> {
    Ok(TaskType {
        name: NAME,
        doc: "Dummy procedure mimicking a pedestal normalization routine on the output of a previous dummy_procedure run.",
        arguments: vec![
            ArgDecl::int("outer_size", "Size of outer loop")
                .with_default(5)
                .validate(Range::new(5.0, 10.0)?),
            ArgDecl::int("inner_size", "Size of inner loop")
                .with_default(10)
                .validate(Range::new(5.0, 10.0)?),
            ArgDecl::float("pause", "Time between loops")
                .with_default(0.01)
                .validate(Range::new(0.01, 1.0)?),
            ArgDecl::string("comp_file", "File to pull contents from")
                .validate(Choices::procedure_files(dummy_procedure::NAME, "*.json")),
        ],
        interfaces: vec![
            InterfaceDecl::capability("iterate", CapabilityKind::Iterate),
            InterfaceDecl::capability("session_log", CapabilityKind::SessionLog),
        ],
        build,
    })
}

fn build(args: &BoundArguments) -> Result<Box<dyn Procedure>> {
    Ok(Box::new(DummyProcess2 {
        outer_size: args.int("outer_size")?,
        inner_size: args.int("inner_size")?,
        pause: Duration::from_secs_f64(args.float("pause")?),
        comp_file: PathBuf::from(args.str("comp_file")?),
    }))
}

struct DummyProcess2 {
    outer_size: i64,
    inner_size: i64,
    pause: Duration,
    comp_file: PathBuf,
}

impl Procedure for DummyProcess2 {
    fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()> {
        let raw = fs::read(&self.comp_file)
            .map_err(|e| anyhow!("failed to read {}: {}", self.comp_file.display(), e))?;
        let previous: Value = serde_json::from_slice(&raw)?;
        let rows = previous
            .get("readout")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        ctx.log_info(format!("Loading previous content: {}", rows));

        let iterate = caps.iterate()?;
        for outer in iterate.over(0..self.outer_size, "Outer Looping") {
            let outer = outer?;
            ctx.log_info(format!("Logging once per outer ({})", outer + 1));
            for inner in iterate.over(0..self.inner_size, "Inner loop") {
                inner?;
                std::thread::sleep(self.pause);
            }
        }

        let mut file = ctx.open_text_file("mytest.txt", "Just for demonstration")?;
        file.write_all(b"I want this to be written")?;

        ctx.set_channel_summary(
            (0..N_CHANNELS)
                .map(|c| SingularResult::channel(c, 0, "SUCCESS"))
                .collect(),
        )?;
        ctx.set_board_summary(SingularResult::board(0, "SUCCESS"))
    }
}
