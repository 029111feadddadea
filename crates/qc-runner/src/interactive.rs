use crate::capability::{CancelFlag, ChannelProgress, ProgressEvent};
use crate::contract::TaskType;
use crate::lock::RunLock;
use crate::session::Session;
use anyhow::{anyhow, Result};
use qc_core::ProcedureResult;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct WorkerCompletion {
    session: Session,
    result: ProcedureResult,
}

/// Front-end driver: owns the session between runs and lends it to one
/// worker thread per run. New runs are rejected while a worker holds the
/// run lock.
pub struct InteractiveSession {
    session: Option<Session>,
    handoff: Arc<Mutex<Option<Session>>>,
    run_lock: RunLock,
    cancel: CancelFlag,
    progress_rx: mpsc::Receiver<ProgressEvent>,
    completions_tx: mpsc::Sender<WorkerCompletion>,
    completions_rx: mpsc::Receiver<WorkerCompletion>,
    worker: Option<thread::JoinHandle<()>>,
    finished: VecDeque<ProcedureResult>,
    next_worker_seq: u64,
}

impl InteractiveSession {
    pub fn new(mut session: Session) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel();
        session.set_reporter(Arc::new(ChannelProgress::new(progress_tx)));
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            run_lock: session.run_lock(),
            cancel: session.cancel_flag(),
            session: Some(session),
            handoff: Arc::new(Mutex::new(None)),
            progress_rx,
            completions_tx,
            completions_rx,
            worker: None,
            finished: VecDeque::new(),
            next_worker_seq: 1,
        }
    }

    /// The session, when no worker is holding it.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn is_busy(&self) -> bool {
        self.run_lock.is_held()
    }

    pub fn request_cancel(&self) {
        self.cancel.set();
    }

    pub fn drain_progress(&self) -> Vec<ProgressEvent> {
        self.progress_rx.try_iter().collect()
    }

    /// Start `task` on a worker thread. Fails with `RunRejected` while a
    /// previous run is still active. A finished run that was not collected
    /// yet stays queued for `poll`/`wait`, and a cancel requested while idle
    /// is discarded.
    pub fn submit(&mut self, task: &TaskType, arguments: BTreeMap<String, Value>) -> Result<()> {
        let guard = self.run_lock.try_acquire()?;
        if let Some(result) = self.try_collect()? {
            self.finished.push_back(result);
        }
        self.cancel.clear();
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("session was lost by a previous worker"))?;
        {
            let mut slot = self
                .handoff
                .lock()
                .map_err(|_| anyhow!("interactive session handoff lock poisoned"))?;
            *slot = Some(session);
        }

        let seq = self.next_worker_seq;
        self.next_worker_seq += 1;
        let handoff = Arc::clone(&self.handoff);
        let completions_tx = self.completions_tx.clone();
        let task = task.clone();
        let spawned = thread::Builder::new()
            .name(format!("qc-worker-{}", seq))
            .spawn(move || {
                let taken = handoff.lock().ok().and_then(|mut slot| slot.take());
                let Some(mut session) = taken else {
                    return;
                };
                let result = session.run_locked(&guard, &task, &arguments).clone();
                let _ = completions_tx.send(WorkerCompletion { session, result });
                drop(guard);
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(worker = seq, "submitted procedure to worker");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.session = self
                    .handoff
                    .lock()
                    .map_err(|_| anyhow!("interactive session handoff lock poisoned"))?
                    .take();
                Err(anyhow!("failed to spawn procedure worker thread: {}", e))
            }
        }
    }

    /// Oldest uncollected result, without blocking.
    pub fn poll(&mut self) -> Result<Option<ProcedureResult>> {
        if let Some(result) = self.finished.pop_front() {
            return Ok(Some(result));
        }
        self.try_collect()
    }

    fn try_collect(&mut self) -> Result<Option<ProcedureResult>> {
        match self.completions_rx.try_recv() {
            Ok(completion) => Ok(Some(self.complete(completion))),
            Err(TryRecvError::Empty) => {
                if self.worker.as_ref().is_some_and(|h| h.is_finished()) {
                    return self.worker_lost();
                }
                Ok(None)
            }
            Err(TryRecvError::Disconnected) => Err(anyhow!("worker completion channel closed")),
        }
    }

    /// Oldest uncollected result, blocking while a run is active. `None`
    /// when nothing is queued or running.
    pub fn wait(&mut self) -> Result<Option<ProcedureResult>> {
        if let Some(result) = self.finished.pop_front() {
            return Ok(Some(result));
        }
        loop {
            if self.worker.is_none() {
                return self.try_collect();
            }
            match self.completions_rx.recv_timeout(WAIT_POLL_INTERVAL) {
                Ok(completion) => return Ok(Some(self.complete(completion))),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(result) = self.try_collect()? {
                        return Ok(Some(result));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("worker completion channel closed"))
                }
            }
        }
    }

    /// Wait for any active run and give the session back. Uncollected
    /// results are dropped; they are already in the session log.
    pub fn into_session(mut self) -> Result<Session> {
        while self.worker.is_some() {
            self.wait()?;
        }
        self.session
            .take()
            .ok_or_else(|| anyhow!("session was lost by a previous worker"))
    }

    fn complete(&mut self, completion: WorkerCompletion) -> ProcedureResult {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.session = Some(completion.session);
        completion.result
    }

    fn worker_lost(&mut self) -> Result<Option<ProcedureResult>> {
        // The worker may have sent just before finishing.
        if let Ok(completion) = self.completions_rx.try_recv() {
            return Ok(Some(self.complete(completion)));
        }
        let joined = self.worker.take().map(|h| h.join());
        match joined {
            Some(Err(_)) => Err(anyhow!("procedure worker panicked; session state was lost")),
            _ => Err(anyhow!("procedure worker exited without returning the session")),
        }
    }
}
