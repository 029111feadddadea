use crate::capability::{Capabilities, CapabilityKind};
use crate::contract::{BoundArguments, InterfaceDecl, TaskType};
use crate::procedure::{Procedure, ProcedureContext};
use anyhow::{anyhow, Result};
use qc_core::{DataEntry, SingularResult};
use serde::Serialize;

pub const NAME: &str = "session_report";
const REPORT_FILE: &str = "session_report.yaml";

pub fn task() -> Result<TaskType> {
    Ok(TaskType {
        name: NAME,
        doc: "Summarize the validity of every earlier run in this session.",
        arguments: Vec::new(),
        interfaces: vec![
            InterfaceDecl::capability("session_log", CapabilityKind::SessionLog),
            InterfaceDecl::other("board_id", "str"),
        ],
        build,
    })
}

fn build(_: &BoundArguments) -> Result<Box<dyn Procedure>> {
    Ok(Box::new(SessionReport))
}

#[derive(Serialize)]
struct ReportLine<'a> {
    name: &'a str,
    start_time: String,
    status: i64,
    message: &'a str,
    valid: bool,
    data_files: usize,
}

#[derive(Serialize)]
struct Report<'a> {
    board_id: &'a str,
    runs: Vec<ReportLine<'a>>,
}

struct SessionReport;

impl Procedure for SessionReport {
    fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()> {
        let log = caps.session_log()?;
        let board_id = caps
            .attribute("board_id")?
            .as_str()
            .ok_or_else(|| anyhow!("board_id attribute is not a string"))?
            .to_string();

        let report = Report {
            board_id: &board_id,
            runs: log
                .iter()
                .map(|r| ReportLine {
                    name: &r.name,
                    start_time: r.start_time.to_rfc3339(),
                    status: r.status_code.code(),
                    message: r.status_code.message(),
                    valid: r.is_valid(),
                    data_files: r.data_files.len(),
                })
                .collect(),
        };
        let n_valid = report.runs.iter().filter(|l| l.valid).count();
        std::fs::write(ctx.make_store_path(REPORT_FILE), serde_yaml::to_string(&report)?)?;
        ctx.record_data(DataEntry::new(REPORT_FILE, "Session report").with("n_runs", log.len()));
        ctx.log_info(format!("{} of {} earlier runs are valid", n_valid, log.len()));

        ctx.set_board_summary(
            SingularResult::board(0, "SUCCESS")
                .with("n_runs", log.len())
                .with("n_valid", n_valid),
        )
    }
}
