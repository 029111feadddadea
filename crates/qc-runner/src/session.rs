use crate::capability::{
    resolve_interfaces, CancelFlag, Capabilities, Iterate, LogProgress, ProgressReporter,
};
use crate::config::DEFAULT_PROGRESS_EVERY;
use crate::contract::TaskType;
use crate::lock::{RunLock, RunLockGuard, RunRejected};
use crate::procedure::ProcedureInstance;
use crate::validate::ValidationContext;
use anyhow::{anyhow, Result};
use qc_core::{
    atomic_write_bytes, ensure_dir, filename_timestamp, timestamp_now, ProcedureResult, StatusCode,
    SESSION_MANIFEST_FILE,
};
use qc_hw::TileboardController;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_RUN_DIR_ATTEMPTS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session directory {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("no session manifest at {0}")]
    MissingManifest(PathBuf),
    #[error("manifest {path} belongs to {found}, expected {expected}")]
    IdentityMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

#[derive(Serialize)]
struct ManifestRef<'a> {
    board_type: &'a str,
    board_id: &'a str,
    results: &'a [ProcedureResult],
}

#[derive(Deserialize)]
struct ManifestDoc {
    board_type: String,
    board_id: String,
    #[serde(default)]
    results: Vec<ProcedureResult>,
}

pub fn session_dir(store_root: &Path, board_type: &str, board_id: &str) -> PathBuf {
    store_root.join(format!("{}.{}", board_type, board_id))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Durable aggregate of one board identity and its procedure results.
pub struct Session {
    board_type: String,
    board_id: String,
    results: Vec<ProcedureResult>,
    store_dir: PathBuf,
    manifest_path: PathBuf,
    controller: Option<Box<dyn TileboardController>>,
    cancel: CancelFlag,
    reporter: Arc<dyn ProgressReporter>,
    run_lock: RunLock,
}

impl Session {
    fn new(store_dir: PathBuf, board_type: String, board_id: String, results: Vec<ProcedureResult>) -> Self {
        Self {
            manifest_path: store_dir.join(SESSION_MANIFEST_FILE),
            store_dir,
            board_type,
            board_id,
            results,
            controller: None,
            cancel: CancelFlag::new(),
            reporter: Arc::new(LogProgress::new(DEFAULT_PROGRESS_EVERY)),
            run_lock: RunLock::new(),
        }
    }

    /// Create a fresh session directory and persist an empty manifest.
    /// Never reuses an existing directory.
    pub fn from_blank(store_root: &Path, board_type: &str, board_id: &str) -> Result<Self> {
        let store_dir = session_dir(&absolute(store_root)?, board_type, board_id);
        if let Some(parent) = store_dir.parent() {
            ensure_dir(parent)?;
        }
        match fs::create_dir(&store_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SessionError::AlreadyExists(store_dir).into())
            }
            Err(e) => {
                return Err(anyhow!(
                    "failed to create session directory {}: {}",
                    store_dir.display(),
                    e
                ))
            }
        }
        let session = Self::new(
            store_dir,
            board_type.to_string(),
            board_id.to_string(),
            Vec::new(),
        );
        session.save()?;
        tracing::info!(
            board_type,
            board_id,
            manifest = %session.manifest_path.display(),
            "created blank session"
        );
        Ok(session)
    }

    pub fn load(store_root: &Path, board_type: &str, board_id: &str) -> Result<Self> {
        let store_dir = session_dir(&absolute(store_root)?, board_type, board_id);
        let manifest_path = store_dir.join(SESSION_MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(SessionError::MissingManifest(manifest_path).into());
        }
        let text = fs::read_to_string(&manifest_path)
            .map_err(|e| anyhow!("failed to read {}: {}", manifest_path.display(), e))?;
        let raw: Value = serde_yaml::from_str(&text)
            .map_err(|e| anyhow!("invalid manifest {}: {}", manifest_path.display(), e))?;
        qc_schemas::validate_session_manifest(&raw)
            .map_err(|e| anyhow!("{}: {}", manifest_path.display(), e))?;
        let doc: ManifestDoc = serde_json::from_value(raw)
            .map_err(|e| anyhow!("invalid manifest {}: {}", manifest_path.display(), e))?;
        if doc.board_type != board_type || doc.board_id != board_id {
            return Err(SessionError::IdentityMismatch {
                path: manifest_path,
                expected: format!("{}.{}", board_type, board_id),
                found: format!("{}.{}", doc.board_type, doc.board_id),
            }
            .into());
        }
        tracing::debug!(
            board_type,
            board_id,
            results = doc.results.len(),
            "loaded session"
        );
        Ok(Self::new(store_dir, doc.board_type, doc.board_id, doc.results))
    }

    pub fn open_or_create(store_root: &Path, board_type: &str, board_id: &str) -> Result<Self> {
        let dir = session_dir(&absolute(store_root)?, board_type, board_id);
        if dir.join(SESSION_MANIFEST_FILE).exists() {
            Self::load(store_root, board_type, board_id)
        } else {
            Self::from_blank(store_root, board_type, board_id)
        }
    }

    pub fn save(&self) -> Result<()> {
        let doc = ManifestRef {
            board_type: &self.board_type,
            board_id: &self.board_id,
            results: &self.results,
        };
        let text = serde_yaml::to_string(&doc)?;
        atomic_write_bytes(&self.manifest_path, text.as_bytes())
    }

    fn save_logged(&self) {
        if let Err(err) = self.save() {
            tracing::error!(
                manifest = %self.manifest_path.display(),
                error = %format!("{:#}", err),
                "failed to persist session"
            );
        }
    }

    pub fn board_type(&self) -> &str {
        &self.board_type
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn results(&self) -> &[ProcedureResult] {
        &self.results
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Values reachable by name-based interface lookup.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        let mut attrs = BTreeMap::new();
        attrs.insert("board_type".to_string(), json!(self.board_type));
        attrs.insert("board_id".to_string(), json!(self.board_id));
        attrs.insert(
            "store_dir".to_string(),
            json!(self.store_dir.to_string_lossy()),
        );
        attrs.insert(
            "manifest_path".to_string(),
            json!(self.manifest_path.to_string_lossy()),
        );
        attrs
    }

    pub fn attach_controller(&mut self, controller: Box<dyn TileboardController>) {
        self.controller = Some(controller);
    }

    pub fn detach_controller(&mut self) -> Option<Box<dyn TileboardController>> {
        self.controller.take()
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn ProgressReporter>) {
        self.reporter = reporter;
    }

    pub fn run_lock(&self) -> RunLock {
        self.run_lock.clone()
    }

    /// Share an externally owned run gate (one per process).
    pub fn with_run_lock(mut self, run_lock: RunLock) -> Self {
        self.run_lock = run_lock;
        self
    }

    pub fn iterate(&self) -> Iterate {
        Iterate::new(self.cancel.clone(), Arc::clone(&self.reporter))
    }

    /// Run one task end to end. Exactly one result is appended and the
    /// session is saved, whatever the body does. Only a concurrent run
    /// holding the run lock makes this return an error, and then nothing is
    /// appended.
    pub fn handle_procedure(
        &mut self,
        task: &TaskType,
        arguments: &BTreeMap<String, Value>,
    ) -> Result<&ProcedureResult, RunRejected> {
        let guard = self.run_lock.try_acquire()?;
        Ok(self.run_locked(&guard, task, arguments))
    }

    /// Body of `handle_procedure` for a caller already holding the run lock.
    pub(crate) fn run_locked(
        &mut self,
        _guard: &RunLockGuard,
        task: &TaskType,
        arguments: &BTreeMap<String, Value>,
    ) -> &ProcedureResult {
        let span = tracing::info_span!(
            "handle_procedure",
            task = task.name,
            board = %format!("{}.{}", self.board_type, self.board_id)
        );
        let _enter = span.enter();

        let allocated = self.allocate_run_dir(task.name);
        let store_base = match &allocated {
            Ok(dir) => dir.clone(),
            Err((planned, _)) => planned.clone(),
        };
        let mut instance = ProcedureInstance::create(task, arguments, store_base);
        let idx = self.results.len();
        self.results.push(instance.result().clone());
        self.save_logged();

        if let Err((_, err)) = allocated {
            instance.abort(StatusCode::execution_error(format!("{:#}", err)));
        } else if instance.validate(&ValidationContext::with_session(
            &self.store_dir,
            &self.results[..idx],
        )) {
            match resolve_interfaces(task.name, &task.interfaces, &self.attributes()) {
                Ok(resolved) => {
                    let iterate = Iterate::new(self.cancel.clone(), Arc::clone(&self.reporter));
                    let controller: Option<&mut dyn TileboardController> =
                        match self.controller.as_mut() {
                            Some(ctl) => Some(&mut **ctl),
                            None => None,
                        };
                    let mut caps =
                        Capabilities::new(resolved, iterate, controller, &self.results[..idx]);
                    instance.run(&mut caps);
                }
                Err(err) => instance.abort(StatusCode::execution_error(err.to_string())),
            }
        }

        // A request ends only the run that observed it.
        self.cancel.clear();
        instance.rebase_data_paths(&self.store_dir);
        self.results[idx] = instance.result().clone();
        self.save_logged();
        instance.mark_persisted();
        let result = &self.results[idx];
        tracing::info!(
            status = result.status_code.code(),
            message = result.status_code.message(),
            valid = result.is_valid(),
            data_files = result.data_files.len(),
            "procedure finished"
        );
        result
    }

    /// Create `<Task>_<timestamp>` under the session directory, adding a
    /// numeric suffix if that name is taken.
    fn allocate_run_dir(&self, task_name: &str) -> Result<PathBuf, (PathBuf, anyhow::Error)> {
        let stem = format!("{}_{}", task_name, filename_timestamp(timestamp_now()));
        let planned = self.store_dir.join(&stem);
        for attempt in 0..MAX_RUN_DIR_ATTEMPTS {
            let candidate = if attempt == 0 {
                planned.clone()
            } else {
                self.store_dir.join(format!("{}_{}", stem, attempt))
            };
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    let err = anyhow!(
                        "failed to create working directory {}: {}",
                        candidate.display(),
                        e
                    );
                    return Err((planned, err));
                }
            }
        }
        let err = anyhow!("no free working directory name for {}", stem);
        Err((planned, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityKind;
    use crate::contract::{ArgDecl, BoundArguments, InterfaceDecl, TaskRegistry};
    use crate::procedure::{Procedure, ProcedureContext};
    use crate::procedures::builtin_registry;
    use chrono::Utc;
    use qc_core::{STATUS_CANCELLED, STATUS_EXECUTION_ERROR, STATUS_INVALID_ARGUMENT};
    use qc_hw::SimulatedController;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    struct Raiser;

    impl Procedure for Raiser {
        fn run(&mut self, ctx: &mut ProcedureContext, _caps: &mut Capabilities<'_>) -> Result<()> {
            let mut file = ctx.open_text_file("partial.txt", "partial output")?;
            std::io::Write::write_all(&mut file, b"half")?;
            Err(anyhow!("boom"))
        }
    }

    fn build_raiser(_: &BoundArguments) -> Result<Box<dyn Procedure>> {
        Ok(Box::new(Raiser))
    }

    fn raiser_task() -> TaskType {
        TaskType {
            name: "raiser",
            doc: "always fails",
            arguments: vec![ArgDecl::int("level", "Level").with_default(1)],
            interfaces: vec![InterfaceDecl::capability("log", CapabilityKind::SessionLog)],
            build: build_raiser,
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = builtin_registry().expect("builtins register");
        registry.register(raiser_task()).expect("raiser registers");
        registry
    }

    fn args(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn fast_dummy_args() -> BTreeMap<String, Value> {
        args(&[
            ("target", json!(70)),
            ("n_events", json!(20)),
            ("pause", json!(0.1)),
        ])
    }

    #[test]
    fn target_scenario_produces_valid_result() {
        let root = TempDirGuard::new("qc_session_target");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0001").expect("session");
        let task = registry.get("dummy_procedure").expect("registered");
        let result = session
            .handle_procedure(task, &fast_dummy_args())
            .expect("not busy")
            .clone();

        assert_eq!(result.name, "dummy_procedure");
        assert_eq!(result.status_code, StatusCode::success());
        assert_eq!(result.board_summary.as_ref().map(|b| b.status), Some(0));
        let descs: Vec<&str> = result.data_files.iter().map(|d| d.desc.as_str()).collect();
        assert!(descs.contains(&"Initial readout"), "{:?}", descs);
        assert!(descs.contains(&"Final_readout"), "{:?}", descs);
        for entry in &result.data_files {
            assert!(Path::new(&entry.path).is_relative(), "{}", entry.path);
            assert!(session.store_dir().join(&entry.path).exists(), "{}", entry.path);
        }
        assert_eq!(result.input.get("target"), Some(&json!(70)));
        assert_eq!(session.results().len(), 1);
    }

    #[test]
    fn raising_body_gets_sentinel_and_is_still_appended() {
        let root = TempDirGuard::new("qc_session_raise");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0002").expect("session");

        let ok = session
            .handle_procedure(registry.get("dummy_procedure").expect("task"), &fast_dummy_args())
            .expect("not busy")
            .status_code
            .clone();
        assert_eq!(session.results().len(), 1);

        let failed = session
            .handle_procedure(registry.get("raiser").expect("task"), &BTreeMap::new())
            .expect("not busy")
            .clone();
        assert_eq!(session.results().len(), 2);
        assert_eq!(failed.status_code.code(), STATUS_EXECUTION_ERROR);
        assert_eq!(failed.status_code.message(), "boom");
        assert_ne!(failed.status_code, ok);
        assert_eq!(failed.data_files.len(), 1, "partial artifacts stay inspectable");
        assert!(!failed.is_valid());

        let reloaded = Session::load(&root.path, "TB3", "0002").expect("reload");
        assert_eq!(reloaded.results(), session.results());
    }

    #[test]
    fn manifest_round_trip_is_byte_identical() {
        let root = TempDirGuard::new("qc_session_roundtrip");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0003").expect("session");
        session
            .handle_procedure(registry.get("dummy_procedure").expect("task"), &fast_dummy_args())
            .expect("not busy");
        session
            .handle_procedure(registry.get("raiser").expect("task"), &BTreeMap::new())
            .expect("not busy");
        session.save().expect("save");
        let first = fs::read(session.manifest_path()).expect("read");

        let reloaded = Session::load(&root.path, "TB3", "0003").expect("load");
        assert_eq!(reloaded.results(), session.results());
        reloaded.save().expect("save again");
        let second = fs::read(reloaded.manifest_path()).expect("read");
        assert_eq!(first, second);
    }

    #[test]
    fn second_blank_creation_fails_and_leaves_first_untouched() {
        let root = TempDirGuard::new("qc_session_blank");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0004").expect("session");
        session
            .handle_procedure(registry.get("raiser").expect("task"), &BTreeMap::new())
            .expect("not busy");
        let before = fs::read(session.manifest_path()).expect("manifest");

        let err = Session::from_blank(&root.path, "TB3", "0004")
            .err()
            .expect("second creation must fail");
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::AlreadyExists(_))
        ));
        assert_eq!(fs::read(session.manifest_path()).expect("manifest"), before);

        let reopened = Session::open_or_create(&root.path, "TB3", "0004").expect("open");
        assert_eq!(reopened.results().len(), 1);
    }

    #[test]
    fn validation_failure_leaves_placeholder_unfinished() {
        let root = TempDirGuard::new("qc_session_invalid");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0005").expect("session");
        let mut bad = fast_dummy_args();
        bad.insert("lower_range".to_string(), json!(3));
        let result = session
            .handle_procedure(registry.get("dummy_procedure").expect("task"), &bad)
            .expect("not busy")
            .clone();
        assert_eq!(result.status_code.code(), STATUS_INVALID_ARGUMENT);
        assert!(result
            .status_code
            .message()
            .contains("Input value [3] failed annotated requirement [Range(-10, 0)]"));
        assert_eq!(result.start_time, result.end_time);
        assert!(result.data_files.is_empty());
        assert_eq!(session.results().len(), 1);
    }

    #[test]
    fn procedure_files_choices_see_prior_results() {
        let root = TempDirGuard::new("qc_session_choices");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0006").expect("session");
        let process2 = registry.get("dummy_process2").expect("task");

        let rejected = session
            .handle_procedure(process2, &args(&[("comp_file", json!("nope.json"))]))
            .expect("not busy")
            .clone();
        assert_eq!(rejected.status_code.code(), STATUS_INVALID_ARGUMENT);

        let dummy = session
            .handle_procedure(registry.get("dummy_procedure").expect("task"), &fast_dummy_args())
            .expect("not busy")
            .clone();
        let comp = session
            .store_dir()
            .join(&dummy.data_files[0].path)
            .to_string_lossy()
            .to_string();
        let accepted = session
            .handle_procedure(
                process2,
                &args(&[("comp_file", json!(comp)), ("pause", json!(0.01))]),
            )
            .expect("not busy")
            .clone();
        assert_eq!(accepted.status_code, StatusCode::success(), "{:?}", accepted.status_code);
        assert!(accepted.is_valid());
    }

    #[test]
    fn controller_capability_requires_attached_handle() {
        let root = TempDirGuard::new("qc_session_hw");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0007").expect("session");
        let task = registry.get("daq_acquire").expect("task");
        let n_events = args(&[("n_events", json!(10))]);

        let detached = session
            .handle_procedure(task, &n_events)
            .expect("not busy")
            .clone();
        assert_eq!(detached.status_code.code(), STATUS_EXECUTION_ERROR);

        session.attach_controller(Box::new(SimulatedController::default()));
        let attached = session
            .handle_procedure(task, &n_events)
            .expect("not busy")
            .clone();
        assert!(attached.is_valid(), "{:?}", attached.status_code);
        assert!(session.detach_controller().is_some());
    }

    #[test]
    fn preset_interrupt_yields_cancelled_status() {
        let root = TempDirGuard::new("qc_session_cancel");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0008").expect("session");
        session.cancel_flag().set();
        let result = session
            .handle_procedure(registry.get("dummy_procedure").expect("task"), &fast_dummy_args())
            .expect("not busy")
            .clone();
        assert_eq!(result.status_code.code(), STATUS_CANCELLED);
        assert!(!result.is_valid());
        assert_eq!(session.results().len(), 1);
        assert!(!session.cancel_flag().is_set());
    }

    #[test]
    fn cancel_request_does_not_carry_into_next_run() {
        let root = TempDirGuard::new("qc_session_cancel_once");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0011").expect("session");
        let task = registry.get("dummy_procedure").expect("task");

        session.cancel_flag().set();
        let first = session
            .handle_procedure(task, &fast_dummy_args())
            .expect("not busy")
            .status_code
            .clone();
        assert_eq!(first.code(), STATUS_CANCELLED);

        let second = session
            .handle_procedure(task, &fast_dummy_args())
            .expect("not busy")
            .clone();
        assert_eq!(second.status_code, StatusCode::success(), "{:?}", second.status_code);
        assert!(second.is_valid());
        assert_eq!(session.results().len(), 2);
    }

    #[test]
    fn busy_lock_rejects_without_appending() {
        let root = TempDirGuard::new("qc_session_busy");
        let registry = registry();
        let mut session = Session::from_blank(&root.path, "TB3", "0009").expect("session");
        let held = session.run_lock().try_acquire().expect("external holder");
        let rejected = session.handle_procedure(registry.get("raiser").expect("task"), &BTreeMap::new());
        assert_eq!(rejected.err(), Some(RunRejected));
        assert!(session.results().is_empty());
        drop(held);
        assert!(session
            .handle_procedure(registry.get("raiser").expect("task"), &BTreeMap::new())
            .is_ok());
        assert!(!session.run_lock().is_held());
    }

    #[test]
    fn load_rejects_schema_violations_and_wrong_identity() {
        let root = TempDirGuard::new("qc_session_schema");
        let session = Session::from_blank(&root.path, "TB3", "0010").expect("session");
        fs::write(
            session.manifest_path(),
            "board_type: TB3\nboard_id: '0010'\nresults:\n- name: x\n  status_code: nope\n",
        )
        .expect("write");
        assert!(Session::load(&root.path, "TB3", "0010").is_err());

        fs::write(
            session.manifest_path(),
            "board_type: TB9\nboard_id: '0010'\nresults: []\n",
        )
        .expect("write");
        let err = Session::load(&root.path, "TB3", "0010").err().expect("mismatch");
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::IdentityMismatch { .. })
        ));
        let missing = Session::load(&root.path, "TB3", "0404").err().expect("missing");
        assert!(matches!(
            missing.downcast_ref::<SessionError>(),
            Some(SessionError::MissingManifest(_))
        ));
    }
}
