//! Static argument/interface descriptor tables for task types, the
//! registration-time checks run over them, and argument binding.

use crate::capability::{CapabilityKind, SESSION_ATTRIBUTES};
use crate::procedure::Procedure;
use crate::validate::{display_value, ValidationContext, ValidationError, Validator};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Implicit per-run working directory; never declared, never user supplied.
pub const WORKING_DIR_ARG: &str = "store_base";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Float,
    Str,
}

impl ArgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
        }
    }

    /// Integers are accepted for floats, and text is parsed for numeric
    /// kinds so form and flag input can be passed through unchanged.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Int, Value::Number(n)) => n.as_i64().map(Value::from),
            (Self::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Float, Value::Number(n)) => n.as_f64().map(|f| json!(f)),
            (Self::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| json!(f)),
            (Self::Str, Value::String(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One constructor argument. A well-formed declaration carries a kind and a
/// description; the validator is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDecl {
    pub name: &'static str,
    pub kind: Option<ArgKind>,
    pub desc: Option<&'static str>,
    pub default: Option<Value>,
    pub validator: Option<Validator>,
}

impl ArgDecl {
    fn declared(name: &'static str, kind: ArgKind, desc: &'static str) -> Self {
        Self {
            name,
            kind: Some(kind),
            desc: Some(desc),
            default: None,
            validator: None,
        }
    }

    pub fn int(name: &'static str, desc: &'static str) -> Self {
        Self::declared(name, ArgKind::Int, desc)
    }

    pub fn float(name: &'static str, desc: &'static str) -> Self {
        Self::declared(name, ArgKind::Float, desc)
    }

    pub fn string(name: &'static str, desc: &'static str) -> Self {
        Self::declared(name, ArgKind::Str, desc)
    }

    /// Argument with no type/description pair; rejected at registration.
    pub fn bare(name: &'static str) -> Self {
        Self {
            name,
            kind: None,
            desc: None,
            default: None,
            validator: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validate(mut self, validator: impl Into<Validator>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    fn is_declared(&self) -> bool {
        self.kind.is_some() && self.desc.is_some_and(|d| !d.trim().is_empty())
    }

    /// Help text: description plus the validator, when there is one.
    pub fn help(&self) -> String {
        let desc = self.desc.unwrap_or_default();
        match &self.validator {
            Some(v) => format!("{} [{}]", desc, v),
            None => desc.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Capability(CapabilityKind),
    /// Not a capability kind. Resolved by name against session attributes.
    Other(&'static str),
}

/// One parameter of a task's execution entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDecl {
    pub name: &'static str,
    pub ty: Option<DeclaredType>,
}

impl InterfaceDecl {
    pub fn capability(name: &'static str, kind: CapabilityKind) -> Self {
        Self {
            name,
            ty: Some(DeclaredType::Capability(kind)),
        }
    }

    pub fn other(name: &'static str, type_name: &'static str) -> Self {
        Self {
            name,
            ty: Some(DeclaredType::Other(type_name)),
        }
    }

    pub fn untyped(name: &'static str) -> Self {
        Self { name, ty: None }
    }
}

pub type BuildFn = fn(&BoundArguments) -> Result<Box<dyn Procedure>>;

/// Registrable task type: its descriptor tables and a constructor.
#[derive(Clone)]
pub struct TaskType {
    pub name: &'static str,
    pub doc: &'static str,
    pub arguments: Vec<ArgDecl>,
    pub interfaces: Vec<InterfaceDecl>,
    pub build: BuildFn,
}

impl fmt::Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskType")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}

impl TaskType {
    pub fn argument(&self, name: &str) -> Option<&ArgDecl> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Enforcing-mode check of every bound argument, in declaration order.
    pub fn check_arguments(
        &self,
        bound: &BoundArguments,
        ctx: &ValidationContext<'_>,
    ) -> Result<(), ValidationError> {
        for decl in &self.arguments {
            let (Some(validator), Some(value)) = (&decl.validator, bound.get(decl.name)) else {
                continue;
            };
            validator.ensure(decl.name, value, ctx)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("task type name [{0}] must be a non-empty identifier")]
    InvalidName(String),
    #[error(
        "task [{task}] has arguments without a (type, description) declaration: {}",
        .arguments.join(", ")
    )]
    UndeclaredArguments { task: String, arguments: Vec<String> },
    #[error("task [{task}] declares argument [{argument}] more than once")]
    DuplicateArgument { task: String, argument: String },
    #[error("task [{task}] default for argument [{argument}] is invalid: {reason}")]
    BadDefault {
        task: String,
        argument: String,
        reason: String,
    },
    #[error(
        "task [{task}] has execution parameters without a declared type: {}",
        .interfaces.join(", ")
    )]
    UntypedInterfaces {
        task: String,
        interfaces: Vec<String>,
    },
    #[error(
        "task [{task}] parameter [{interface}] has type [{type_name}], which is neither a capability nor a session attribute"
    )]
    UnresolvableInterface {
        task: String,
        interface: String,
        type_name: String,
    },
    #[error("task type [{0}] is already registered")]
    DuplicateTask(String),
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registration-time check of one task type's descriptor tables.
pub fn validate_task(task: &TaskType) -> Result<(), ContractError> {
    if !is_identifier(task.name) {
        return Err(ContractError::InvalidName(task.name.to_string()));
    }

    let undeclared: Vec<String> = task
        .arguments
        .iter()
        .filter(|a| a.name != WORKING_DIR_ARG && !a.is_declared())
        .map(|a| a.name.to_string())
        .collect();
    if !undeclared.is_empty() {
        return Err(ContractError::UndeclaredArguments {
            task: task.name.to_string(),
            arguments: undeclared,
        });
    }

    let mut seen = BTreeSet::new();
    for decl in &task.arguments {
        if !seen.insert(decl.name) || decl.name == WORKING_DIR_ARG {
            return Err(ContractError::DuplicateArgument {
                task: task.name.to_string(),
                argument: decl.name.to_string(),
            });
        }
        if let (Some(kind), Some(default)) = (decl.kind, &decl.default) {
            let bad_default = |reason: String| ContractError::BadDefault {
                task: task.name.to_string(),
                argument: decl.name.to_string(),
                reason,
            };
            let coerced = kind
                .coerce(default)
                .ok_or_else(|| bad_default(format!("[{}] is not {}", display_value(default), kind)))?;
            if let Some(validator @ Validator::Range(_)) = &decl.validator {
                validator
                    .ensure(decl.name, &coerced, &ValidationContext::detached())
                    .map_err(|e| bad_default(e.to_string()))?;
            }
        }
    }

    let untyped: Vec<String> = task
        .interfaces
        .iter()
        .filter(|i| i.ty.is_none())
        .map(|i| i.name.to_string())
        .collect();
    if !untyped.is_empty() {
        return Err(ContractError::UntypedInterfaces {
            task: task.name.to_string(),
            interfaces: untyped,
        });
    }

    for iface in &task.interfaces {
        if let Some(DeclaredType::Other(type_name)) = iface.ty {
            if !SESSION_ATTRIBUTES.contains(&iface.name) {
                return Err(ContractError::UnresolvableInterface {
                    task: task.name.to_string(),
                    interface: iface.name.to_string(),
                    type_name: type_name.to_string(),
                });
            }
            tracing::warn!(
                task = task.name,
                parameter = iface.name,
                type_name,
                "deprecated: parameter type is not a capability kind, resolving by session attribute name"
            );
        }
    }
    Ok(())
}

/// Ordered set of runnable task types; declaration order is preserved.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskType>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: TaskType) -> Result<(), ContractError> {
        validate_task(&task)?;
        if self.get(task.name).is_some() {
            return Err(ContractError::DuplicateTask(task.name.to_string()));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskType> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskType> {
        self.tasks.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("unknown argument [{0}]")]
    Unknown(String),
    #[error("missing required argument [{0}]")]
    Missing(String),
    #[error("argument [{argument}]: cannot interpret [{value}] as {kind}")]
    Mismatch {
        argument: String,
        value: String,
        kind: ArgKind,
    },
}

/// Argument values after defaults and coercion, keyed by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundArguments {
    values: BTreeMap<String, Value>,
}

impl BoundArguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    fn require(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow!("argument [{}] is not bound", name))
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| anyhow!("argument [{}] is not an int", name))
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| anyhow!("argument [{}] is not a float", name))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| anyhow!("argument [{}] is not a str", name))
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.values
    }
}

pub fn bind_arguments(
    task: &TaskType,
    supplied: &BTreeMap<String, Value>,
) -> Result<BoundArguments, BindError> {
    if let Some(unknown) = supplied.keys().find(|k| task.argument(k).is_none()) {
        return Err(BindError::Unknown(unknown.clone()));
    }
    let mut values = BTreeMap::new();
    for decl in &task.arguments {
        let raw = supplied
            .get(decl.name)
            .or(decl.default.as_ref())
            .ok_or_else(|| BindError::Missing(decl.name.to_string()))?;
        let value = match decl.kind {
            Some(kind) => kind.coerce(raw).ok_or_else(|| BindError::Mismatch {
                argument: decl.name.to_string(),
                value: display_value(raw),
                kind,
            })?,
            None => raw.clone(),
        };
        values.insert(decl.name.to_string(), value);
    }
    Ok(BoundArguments { values })
}
