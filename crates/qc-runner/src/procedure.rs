use crate::capability::{Capabilities, Cancelled};
use crate::contract::{bind_arguments, BoundArguments, TaskType};
use crate::validate::ValidationContext;
use anyhow::{anyhow, Result};
use qc_core::{relative_path, DataEntry, ProcedureResult, SingularResult, StatusCode};
use qc_hw::{create_nested, merge_nested, Endpoint, TileboardController};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the pull server writes before the file is moved into the run dir.
pub const ACQUIRE_STAGING_DIR: &str = "/tmp";
pub const ACQUIRE_RUN_TYPE: &str = "data_acquire";
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Body of one task type. Built fresh for every run.
pub trait Procedure: Send {
    fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()>;
}

/// Run-scoped state a procedure body writes into: its working directory and
/// its own result record.
#[derive(Debug)]
pub struct ProcedureContext {
    name: String,
    store_base: PathBuf,
    result: ProcedureResult,
}

impl ProcedureContext {
    pub fn new(name: impl Into<String>, store_base: PathBuf, result: ProcedureResult) -> Self {
        Self {
            name: name.into(),
            store_base,
            result,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_base(&self) -> &Path {
        &self.store_base
    }

    pub fn result(&self) -> &ProcedureResult {
        &self.result
    }

    pub fn make_store_path(&self, file: &str) -> PathBuf {
        self.store_base.join(file)
    }

    pub fn full_path(&self, entry: &DataEntry) -> PathBuf {
        let path = Path::new(&entry.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.store_base.join(path)
        }
    }

    /// Append an artifact record. Relative paths are anchored at the run's
    /// working directory.
    pub fn record_data(&mut self, mut entry: DataEntry) -> &DataEntry {
        entry.path = self.full_path(&entry).to_string_lossy().to_string();
        self.result.push_data(entry)
    }

    /// Create a text file in the working directory and record it.
    pub fn open_text_file(&mut self, file: &str, desc: &str) -> Result<fs::File> {
        let path = self.make_store_path(file);
        let handle = fs::File::create(&path)
            .map_err(|e| anyhow!("failed to create {}: {}", path.display(), e))?;
        self.record_data(DataEntry::new(file, desc));
        Ok(handle)
    }

    pub fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<PathBuf> {
        let path = self.make_store_path(file);
        fs::write(&path, serde_json::to_vec_pretty(value)?)
            .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
        Ok(path)
    }

    pub fn set_board_summary(&mut self, summary: SingularResult) -> Result<()> {
        Ok(self.result.set_board_summary(summary)?)
    }

    pub fn set_channel_summary(&mut self, summary: Vec<SingularResult>) -> Result<()> {
        Ok(self.result.set_channel_summary(summary)?)
    }

    pub fn log_info(&self, msg: impl Display) {
        tracing::info!(procedure = %self.name, "{}", msg);
    }

    pub fn log_warn(&self, msg: impl Display) {
        tracing::warn!(procedure = %self.name, "{}", msg);
    }

    pub fn log_error(&self, msg: impl Display) {
        tracing::error!(procedure = %self.name, "{}", msg);
    }

    /// Take `n_events` through the rig and record the produced data file.
    /// `entry.path` is the destination relative to the working directory.
    pub fn acquire(
        &mut self,
        ctl: &mut dyn TileboardController,
        n_events: u64,
        entry: DataEntry,
    ) -> Result<&DataEntry> {
        merge_nested(
            ctl.config_mut(Endpoint::Daq),
            &create_nested(&["daq", "NEvents"], json!(n_events.to_string())),
        )?;
        merge_nested(
            ctl.config_mut(Endpoint::Pull),
            &json!({"global": {"outputDirectory": ACQUIRE_STAGING_DIR, "run_type": ACQUIRE_RUN_TYPE}}),
        )?;

        ctl.configure(Endpoint::Pull, None)?;
        ctl.configure(Endpoint::Daq, None)?;
        ctl.start(Endpoint::Pull)?;
        ctl.start(Endpoint::Daq)?;
        while !ctl.is_complete(Endpoint::Daq)? {
            ctl.sleep(ACQUIRE_POLL_INTERVAL);
        }
        ctl.stop(Endpoint::Daq)?;
        ctl.stop(Endpoint::Pull)?;

        ctl.collect_output(&self.full_path(&entry))?;
        Ok(self.record_data(entry))
    }

    pub fn into_result(self) -> ProcedureResult {
        self.result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Validating,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Persisted,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One execution attempt of a task type.
pub struct ProcedureInstance {
    bound: Option<BoundArguments>,
    task: TaskType,
    ctx: ProcedureContext,
    state: InstanceState,
}

impl ProcedureInstance {
    /// Bind `supplied` and attach the initial result. A binding failure is
    /// recorded as an invalid-argument status and blocks the run.
    pub fn create(task: &TaskType, supplied: &BTreeMap<String, Value>, store_base: PathBuf) -> Self {
        let (bound, result) = match bind_arguments(task, supplied) {
            Ok(bound) => {
                let result = ProcedureResult::new(task.name, bound.as_map().clone());
                (Some(bound), result)
            }
            Err(err) => {
                let mut result = ProcedureResult::new(task.name, supplied.clone());
                result.status_code = StatusCode::invalid_argument(err.to_string());
                (None, result)
            }
        };
        Self {
            bound,
            task: task.clone(),
            ctx: ProcedureContext::new(task.name, store_base, result),
            state: InstanceState::Created,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn result(&self) -> &ProcedureResult {
        self.ctx.result()
    }

    pub fn store_base(&self) -> &Path {
        self.ctx.store_base()
    }

    /// Enforcing-mode argument checks. On failure the status carries the
    /// validator message and the end time is left as created.
    pub fn validate(&mut self, vctx: &ValidationContext<'_>) -> bool {
        self.state = InstanceState::Validating;
        let Some(bound) = &self.bound else {
            self.ctx.log_error(self.ctx.result.status_code.message());
            self.state = InstanceState::Failed;
            return false;
        };
        match self.task.check_arguments(bound, vctx) {
            Ok(()) => true,
            Err(err) => {
                self.ctx.log_error(&err);
                self.ctx.result.status_code = StatusCode::invalid_argument(err.to_string());
                self.state = InstanceState::Failed;
                false
            }
        }
    }

    /// Execute the body. Every error, panic and observed cancellation is
    /// folded into the result status; the end time is always recorded.
    pub fn run(&mut self, caps: &mut Capabilities<'_>) -> &ProcedureResult {
        if self.state != InstanceState::Validating {
            return self.ctx.result();
        }
        let Some(bound) = self.bound.as_ref() else {
            return self.ctx.result();
        };
        let span = tracing::info_span!("procedure", name = %self.ctx.name);
        let _enter = span.enter();

        self.state = InstanceState::Running;
        let build = self.task.build;
        let ctx = &mut self.ctx;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let mut body = build(bound)?;
            body.run(ctx, caps)
        }));

        let (state, status) = match outcome {
            Ok(Ok(())) if caps.cancel_observed() => (InstanceState::Cancelled, StatusCode::cancelled()),
            Ok(Ok(())) => (InstanceState::Succeeded, StatusCode::success()),
            Ok(Err(err)) if err.chain().any(|e| e.is::<Cancelled>()) || caps.cancel_observed() => {
                (InstanceState::Cancelled, StatusCode::cancelled())
            }
            Ok(Err(err)) => {
                let message = format!("{:#}", err);
                self.ctx.log_error(&message);
                (InstanceState::Failed, StatusCode::execution_error(message))
            }
            Err(payload) => {
                let message = panic_payload_to_string(payload.as_ref());
                self.ctx.log_error(format!("panicked: {}", message));
                (InstanceState::Failed, StatusCode::execution_error(message))
            }
        };
        self.ctx.log_info("Return results");
        self.ctx.result.finish(status);
        self.state = state;
        self.ctx.result()
    }

    /// Fail the attempt before the body ran (setup or resolution problems).
    pub fn abort(&mut self, status: StatusCode) {
        self.ctx.log_error(status.message());
        self.ctx.result.finish(status);
        self.state = InstanceState::Failed;
    }

    /// Rewrite recorded artifact paths relative to `base`.
    pub fn rebase_data_paths(&mut self, base: &Path) {
        for entry in &mut self.ctx.result.data_files {
            entry.path = relative_path(Path::new(&entry.path), base)
                .to_string_lossy()
                .to_string();
        }
    }

    pub fn mark_persisted(&mut self) {
        self.state = InstanceState::Persisted;
    }

    pub fn into_result(self) -> ProcedureResult {
        self.ctx.into_result()
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CancelFlag, CapabilityKind, Iterate, LogProgress, ResolvedInterface};
    use crate::contract::{ArgDecl, BuildFn, InterfaceDecl};
    use crate::validate::Range;
    use qc_core::{STATUS_EXECUTION_ERROR, STATUS_INVALID_ARGUMENT};
    use qc_hw::SimulatedController;
    use std::sync::Arc;

    struct Scripted {
        mode: &'static str,
    }

    impl Procedure for Scripted {
        fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()> {
            match self.mode {
                "boom" => Err(anyhow!("boom")),
                "panic" => panic!("wires crossed"),
                "loop" => {
                    for step in caps.iterate()?.over(0..5, "loop") {
                        let step = step?;
                        ctx.record_data(DataEntry::new(format!("step_{}.txt", step), "step"));
                    }
                    ctx.set_board_summary(SingularResult::board(0, "SUCCESS"))
                }
                _ => ctx.set_board_summary(SingularResult::board(0, "SUCCESS")),
            }
        }
    }

    fn build_boom(_: &BoundArguments) -> Result<Box<dyn Procedure>> {
        Ok(Box::new(Scripted { mode: "boom" }))
    }

    fn build_panic(_: &BoundArguments) -> Result<Box<dyn Procedure>> {
        Ok(Box::new(Scripted { mode: "panic" }))
    }

    fn build_loop(_: &BoundArguments) -> Result<Box<dyn Procedure>> {
        Ok(Box::new(Scripted { mode: "loop" }))
    }

    fn task(build: BuildFn) -> TaskType {
        TaskType {
            name: "scripted",
            doc: "",
            arguments: vec![ArgDecl::int("level", "Level")
                .with_default(5)
                .validate(Range::new(0.0, 10.0).expect("bounds"))],
            interfaces: vec![InterfaceDecl::capability("iterate", CapabilityKind::Iterate)],
            build,
        }
    }

    fn caps_with(cancel: CancelFlag) -> Capabilities<'static> {
        Capabilities::new(
            vec![ResolvedInterface::Capability {
                name: "iterate",
                kind: CapabilityKind::Iterate,
            }],
            Iterate::new(cancel, Arc::new(LogProgress::new(100))),
            None,
            &[],
        )
    }

    fn run_task(build: BuildFn, cancel: CancelFlag) -> ProcedureInstance {
        let mut instance =
            ProcedureInstance::create(&task(build), &BTreeMap::new(), PathBuf::from("/runs/x"));
        assert!(instance.validate(&ValidationContext::detached()));
        instance.run(&mut caps_with(cancel));
        instance
    }

    #[test]
    fn errors_become_execution_status() {
        let instance = run_task(build_boom, CancelFlag::new());
        assert_eq!(instance.state(), InstanceState::Failed);
        assert_eq!(
            instance.result().status_code,
            StatusCode(STATUS_EXECUTION_ERROR, "boom".to_string())
        );
    }

    #[test]
    fn panics_are_contained() {
        let instance = run_task(build_panic, CancelFlag::new());
        assert_eq!(instance.state(), InstanceState::Failed);
        assert_eq!(instance.result().status_code.code(), STATUS_EXECUTION_ERROR);
        assert_eq!(instance.result().status_code.message(), "wires crossed");
    }

    #[test]
    fn successful_run_anchors_paths_in_working_dir() {
        let instance = run_task(build_loop, CancelFlag::new());
        assert_eq!(instance.state(), InstanceState::Succeeded);
        assert!(instance.result().is_valid());
        assert_eq!(instance.result().data_files.len(), 5);
        assert_eq!(
            instance.result().last_data().map(|d| d.path.as_str()),
            Some("/runs/x/step_4.txt")
        );
        assert!(instance.result().end_time >= instance.result().start_time);
    }

    #[test]
    fn preset_cancel_yields_cancelled_status() {
        let cancel = CancelFlag::new();
        cancel.set();
        let instance = run_task(build_loop, cancel);
        assert_eq!(instance.state(), InstanceState::Cancelled);
        assert!(instance.result().status_code.is_cancelled());
        assert!(instance.result().data_files.is_empty());
    }

    #[test]
    fn validation_failure_blocks_run() {
        let mut supplied = BTreeMap::new();
        supplied.insert("level".to_string(), json!(11));
        let mut instance =
            ProcedureInstance::create(&task(build_boom), &supplied, PathBuf::from("/runs/y"));
        let created_end = instance.result().end_time;
        assert!(!instance.validate(&ValidationContext::detached()));
        instance.run(&mut caps_with(CancelFlag::new()));
        assert_eq!(instance.state(), InstanceState::Failed);
        assert_eq!(instance.result().status_code.code(), STATUS_INVALID_ARGUMENT);
        assert!(instance
            .result()
            .status_code
            .message()
            .contains("Input value [11] failed annotated requirement [Range(0, 10)]"));
        assert_eq!(instance.result().end_time, created_end);
    }

    #[test]
    fn binding_failure_keeps_raw_input() {
        let mut supplied = BTreeMap::new();
        supplied.insert("levle".to_string(), json!(3));
        let mut instance =
            ProcedureInstance::create(&task(build_boom), &supplied, PathBuf::from("/runs/z"));
        assert_eq!(instance.result().input, supplied);
        assert!(!instance.validate(&ValidationContext::detached()));
        assert_eq!(
            instance.result().status_code,
            StatusCode::invalid_argument("unknown argument [levle]")
        );
    }

    #[test]
    fn acquire_drives_the_rig_and_records_the_file() {
        let dir = std::env::temp_dir().join(format!(
            "qc_runner_acquire_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let mut ctl = SimulatedController::default();
        let mut ctx = ProcedureContext::new(
            "daq_acquire",
            dir.clone(),
            ProcedureResult::new("daq_acquire", BTreeMap::new()),
        );
        let entry = ctx
            .acquire(&mut ctl, 64, DataEntry::new("run.json", "acquired").with("n_events", 64))
            .expect("acquire")
            .clone();
        assert_eq!(entry.path, dir.join("run.json").to_string_lossy());
        assert_eq!(entry.extra("n_events"), Some(&json!(64)));
        let payload: Value =
            serde_json::from_slice(&fs::read(dir.join("run.json")).expect("file")).expect("json");
        assert_eq!(payload["n_events"], json!(64));
        assert_eq!(payload["run_type"], json!(ACQUIRE_RUN_TYPE));
        assert_eq!(
            &ctl.calls()[..4],
            &["configure:pull", "configure:daq", "start:pull", "start:daq"]
        );
        let _ = fs::remove_dir_all(dir);
    }
}
