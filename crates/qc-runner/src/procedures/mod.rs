//! Built-in task types, in the order front ends list them.

pub mod daq_acquire;
pub mod dummy_procedure;
pub mod dummy_process2;
pub mod session_report;

use crate::contract::TaskRegistry;
use anyhow::Result;

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    for task in [
        dummy_process2::task()?,
        dummy_procedure::task()?,
        daq_acquire::task()?,
        session_report::task()?,
    ] {
        registry.register(task)?;
    }
    Ok(registry)
}
