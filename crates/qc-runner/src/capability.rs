use crate::contract::{ContractError, DeclaredType, InterfaceDecl};
use anyhow::{anyhow, Result};
use qc_core::ProcedureResult;
use qc_hw::TileboardController;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Session attributes reachable through name-based interface lookup.
pub const SESSION_ATTRIBUTES: [&str; 4] = ["board_type", "board_id", "store_dir", "manifest_path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Iterate,
    Controller,
    SessionLog,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iterate => "iterate",
            Self::Controller => "controller",
            Self::SessionLog => "session_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedInterface {
    Capability {
        name: &'static str,
        kind: CapabilityKind,
    },
    Attribute {
        name: &'static str,
        value: Value,
    },
}

/// Map each declared execution parameter to its provider, in declaration
/// order. Pure: the same inputs always give the same output.
pub fn resolve_interfaces(
    task: &str,
    decls: &[InterfaceDecl],
    attributes: &BTreeMap<String, Value>,
) -> Result<Vec<ResolvedInterface>, ContractError> {
    decls
        .iter()
        .map(|decl| match decl.ty {
            Some(DeclaredType::Capability(kind)) => Ok(ResolvedInterface::Capability {
                name: decl.name,
                kind,
            }),
            Some(DeclaredType::Other(type_name)) => attributes
                .get(decl.name)
                .map(|value| ResolvedInterface::Attribute {
                    name: decl.name,
                    value: value.clone(),
                })
                .ok_or_else(|| ContractError::UnresolvableInterface {
                    task: task.to_string(),
                    interface: decl.name.to_string(),
                    type_name: type_name.to_string(),
                }),
            None => Err(ContractError::UntypedInterfaces {
                task: task.to_string(),
                interfaces: vec![decl.name.to_string()],
            }),
        })
        .collect()
}

/// Shared interrupt request, polled at iteration boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by user")]
pub struct Cancelled;

pub trait ProgressReporter: Send + Sync {
    fn begin(&self, desc: &str, total: Option<usize>);

    fn advance(&self, desc: &str, done: usize, total: Option<usize>);

    fn finish(&self, desc: &str, done: usize);
}

/// Headless reporter: log every `every` steps and at the last step.
#[derive(Debug, Clone)]
pub struct LogProgress {
    every: usize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl ProgressReporter for LogProgress {
    fn begin(&self, desc: &str, total: Option<usize>) {
        tracing::debug!(desc, total, "iteration started");
    }

    fn advance(&self, desc: &str, done: usize, total: Option<usize>) {
        if done % self.every == 0 || Some(done) == total {
            tracing::info!(desc, done, total, "progress");
        }
    }

    fn finish(&self, desc: &str, done: usize) {
        tracing::debug!(desc, done, "iteration finished");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin {
        desc: String,
        total: Option<usize>,
    },
    Advance {
        desc: String,
        done: usize,
        total: Option<usize>,
    },
    Finish {
        desc: String,
        done: usize,
    },
}

/// Forwards progress to a controlling thread. Send failures (receiver gone)
/// are ignored.
#[derive(Debug)]
pub struct ChannelProgress {
    tx: Mutex<mpsc::Sender<ProgressEvent>>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl ProgressReporter for ChannelProgress {
    fn begin(&self, desc: &str, total: Option<usize>) {
        self.send(ProgressEvent::Begin {
            desc: desc.to_string(),
            total,
        });
    }

    fn advance(&self, desc: &str, done: usize, total: Option<usize>) {
        self.send(ProgressEvent::Advance {
            desc: desc.to_string(),
            done,
            total,
        });
    }

    fn finish(&self, desc: &str, done: usize) {
        self.send(ProgressEvent::Finish {
            desc: desc.to_string(),
            done,
        });
    }
}

/// Cooperative-iteration capability.
#[derive(Clone)]
pub struct Iterate {
    cancel: CancelFlag,
    reporter: Arc<dyn ProgressReporter>,
    observed: Arc<AtomicBool>,
}

impl Iterate {
    pub fn new(cancel: CancelFlag, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            cancel,
            reporter,
            observed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wrap `items`, reporting one progress step per element and checking
    /// the cancel flag before each one. After a cancellation the sequence
    /// yields a single `Err(Cancelled)` and then ends.
    pub fn over<I: IntoIterator>(&self, items: I, desc: &str) -> Steps<I::IntoIter> {
        let inner = items.into_iter();
        let total = match inner.size_hint() {
            (lo, Some(hi)) if lo == hi => Some(hi),
            _ => None,
        };
        self.reporter.begin(desc, total);
        Steps {
            inner,
            desc: desc.to_string(),
            done: 0,
            total,
            stopped: false,
            iterate: self.clone(),
        }
    }

    /// True once any sequence from this capability stopped on a cancel.
    pub fn cancel_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}

pub struct Steps<I> {
    inner: I,
    desc: String,
    done: usize,
    total: Option<usize>,
    stopped: bool,
    iterate: Iterate,
}

impl<I: Iterator> Iterator for Steps<I> {
    type Item = Result<I::Item, Cancelled>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if self.iterate.cancel.is_set() {
            self.stopped = true;
            self.iterate.observed.store(true, Ordering::SeqCst);
            tracing::warn!(desc = %self.desc, done = self.done, "cancellation observed");
            return Some(Err(Cancelled));
        }
        match self.inner.next() {
            Some(item) => {
                self.done += 1;
                self.iterate
                    .reporter
                    .advance(&self.desc, self.done, self.total);
                Some(Ok(item))
            }
            None => {
                self.stopped = true;
                None
            }
        }
    }
}

impl<I> Drop for Steps<I> {
    fn drop(&mut self) {
        self.iterate.reporter.finish(&self.desc, self.done);
    }
}

/// Resolved collaborators handed to a running procedure.
pub struct Capabilities<'a> {
    resolved: Vec<ResolvedInterface>,
    iterate: Iterate,
    controller: Option<&'a mut dyn TileboardController>,
    session_log: &'a [ProcedureResult],
}

impl<'a> Capabilities<'a> {
    pub fn new(
        resolved: Vec<ResolvedInterface>,
        iterate: Iterate,
        controller: Option<&'a mut dyn TileboardController>,
        session_log: &'a [ProcedureResult],
    ) -> Self {
        Self {
            resolved,
            iterate,
            controller,
            session_log,
        }
    }

    pub fn resolved(&self) -> &[ResolvedInterface] {
        &self.resolved
    }

    fn declared(&self, kind: CapabilityKind) -> Result<()> {
        let found = self
            .resolved
            .iter()
            .any(|r| matches!(r, ResolvedInterface::Capability { kind: k, .. } if *k == kind));
        if found {
            Ok(())
        } else {
            Err(anyhow!("capability [{}] was not declared", kind.as_str()))
        }
    }

    pub fn iterate(&self) -> Result<&Iterate> {
        self.declared(CapabilityKind::Iterate)?;
        Ok(&self.iterate)
    }

    pub fn controller(&mut self) -> Result<&mut dyn TileboardController> {
        self.declared(CapabilityKind::Controller)?;
        match self.controller {
            Some(ref mut ctl) => Ok(&mut **ctl),
            None => Err(anyhow!("no hardware controller is attached to the session")),
        }
    }

    pub fn session_log(&self) -> Result<&'a [ProcedureResult]> {
        self.declared(CapabilityKind::SessionLog)?;
        Ok(self.session_log)
    }

    pub fn attribute(&self, name: &str) -> Result<&Value> {
        self.resolved
            .iter()
            .find_map(|r| match r {
                ResolvedInterface::Attribute { name: n, value } if *n == name => Some(value),
                _ => None,
            })
            .ok_or_else(|| anyhow!("session attribute [{}] was not declared", name))
    }

    pub fn cancel_observed(&self) -> bool {
        self.iterate.cancel_observed()
    }
}
