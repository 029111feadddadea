use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Args, Command, FromArgMatches};
use qc_core::ProcedureResult;
use qc_hw::SimulatedController;
use qc_runner::{
    builtin_registry, ArgDecl, LogProgress, RunnerConfig, Session, TaskRegistry, TaskType,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Board type, e.g. TB3_D8
    #[arg(long, global = true)]
    board_type: Option<String>,
    /// Board serial number
    #[arg(long, global = true)]
    board_id: Option<String>,
    /// Store root (overrides QCMANAGER_STORE)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Attach an in-memory tileboard controller
    #[arg(long, global = true)]
    simulate_hw: bool,
    /// YAML base configuration for the controller endpoints
    #[arg(long, global = true)]
    base_config_file: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

struct CommandOutput {
    payload: Option<Value>,
    success: bool,
}

impl CommandOutput {
    fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn main() -> Result<()> {
    let registry = builtin_registry()?;
    let matches = build_cli(&registry).get_matches();
    let globals = GlobalArgs::from_arg_matches(&matches)?;
    init_tracing(globals.log_json);

    let json_mode = globals.json;
    match run_command(&registry, &globals, &matches) {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if !output.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn build_cli(registry: &TaskRegistry) -> Command {
    let cmd = Command::new("qc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tileboard QA/QC procedure runner")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("list").about("List registered procedures and their arguments"))
        .subcommand(Command::new("show").about("Show the results recorded for a board"));
    let cmd = GlobalArgs::augment_args(cmd);
    registry
        .iter()
        .fold(cmd, |cmd, task| cmd.subcommand(task_command(task)))
}

fn task_command(task: &TaskType) -> Command {
    task.arguments.iter().fold(
        Command::new(task.name).about(task.doc),
        |cmd, decl| cmd.arg(task_arg(decl)),
    )
}

fn task_arg(decl: &ArgDecl) -> Arg {
    let mut help = decl.help();
    if let Some(default) = &decl.default {
        help = format!("{} (default: {})", help, default);
    }
    let arg = Arg::new(decl.name)
        .long(decl.name)
        .help(help)
        .required(decl.is_required())
        .allow_hyphen_values(true);
    match decl.kind {
        Some(kind) => arg.value_name(kind.as_str()),
        None => arg,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn run_command(
    registry: &TaskRegistry,
    globals: &GlobalArgs,
    matches: &ArgMatches,
) -> Result<CommandOutput> {
    match matches.subcommand() {
        Some(("list", _)) => Ok(CommandOutput::ok(list_tasks(registry, globals.json))),
        Some(("show", _)) => {
            let session = open_session(globals)?;
            Ok(CommandOutput::ok(show_session(&session, globals.json)))
        }
        Some((name, sub)) => {
            let task = registry
                .get(name)
                .ok_or_else(|| anyhow!("unknown procedure: {}", name))?;
            run_task(task, globals, sub)
        }
        None => Err(anyhow!("no command given")),
    }
}

fn open_session(globals: &GlobalArgs) -> Result<Session> {
    let board_type = globals
        .board_type
        .as_deref()
        .ok_or_else(|| anyhow!("--board-type is required for this command"))?;
    let board_id = globals
        .board_id
        .as_deref()
        .ok_or_else(|| anyhow!("--board-id is required for this command"))?;
    let mut config = RunnerConfig::from_env()?;
    if let Some(store) = &globals.store {
        config = config.with_store_root(store);
    }

    let mut session = Session::open_or_create(&config.store_root, board_type, board_id)?;
    session.set_reporter(Arc::new(LogProgress::new(config.progress_every)));
    if globals.simulate_hw {
        let controller = match &globals.base_config_file {
            Some(path) => SimulatedController::from_config_file(path)?,
            None => SimulatedController::new(SimulatedController::default_config()),
        };
        session.attach_controller(Box::new(controller));
    } else if globals.base_config_file.is_some() {
        tracing::warn!("--base-config-file is ignored without --simulate-hw");
    }
    Ok(session)
}

fn run_task(task: &TaskType, globals: &GlobalArgs, sub: &ArgMatches) -> Result<CommandOutput> {
    let mut session = open_session(globals)?;
    let cancel = session.cancel_flag();
    ctrlc::set_handler(move || cancel.set())
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let mut arguments = BTreeMap::new();
    for decl in &task.arguments {
        if let Some(raw) = sub.get_one::<String>(decl.name) {
            arguments.insert(decl.name.to_string(), Value::String(raw.clone()));
        }
    }

    let result = session.handle_procedure(task, &arguments)?.clone();
    let success = result.is_valid();
    if globals.json {
        return Ok(CommandOutput {
            payload: Some(json!({
                "ok": success,
                "command": task.name,
                "manifest": session.manifest_path().display().to_string(),
                "result": serde_json::to_value(&result)?,
            })),
            success,
        });
    }
    print_result(&result);
    println!("manifest: {}", session.manifest_path().display());
    Ok(CommandOutput {
        payload: None,
        success,
    })
}

fn list_tasks(registry: &TaskRegistry, json_mode: bool) -> Option<Value> {
    if json_mode {
        let tasks: Vec<Value> = registry
            .iter()
            .map(|task| {
                json!({
                    "name": task.name,
                    "doc": task.doc,
                    "arguments": task.arguments.iter().map(|a| json!({
                        "name": a.name,
                        "kind": a.kind.map(|k| k.as_str()),
                        "desc": a.desc,
                        "required": a.is_required(),
                        "default": a.default,
                        "validator": a.validator.as_ref().map(|v| v.to_string()),
                    })).collect::<Vec<_>>(),
                    "interfaces": task.interfaces.iter().map(|i| i.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        return Some(json!({ "ok": true, "command": "list", "tasks": tasks }));
    }
    for task in registry.iter() {
        println!("{}: {}", task.name, task.doc);
        for decl in &task.arguments {
            let default = decl
                .default
                .as_ref()
                .map(|d| format!(" = {}", d))
                .unwrap_or_default();
            println!(
                "  --{} <{}>{}  {}",
                decl.name,
                decl.kind.map(|k| k.as_str()).unwrap_or("?"),
                default,
                decl.help()
            );
        }
    }
    None
}

fn show_session(session: &Session, json_mode: bool) -> Option<Value> {
    if json_mode {
        let results: Vec<Value> = session
            .results()
            .iter()
            .map(|r| {
                json!({
                    "name": r.name,
                    "start_time": r.start_time.to_rfc3339(),
                    "status": r.status_code.code(),
                    "message": r.status_code.message(),
                    "valid": r.is_valid(),
                    "data_files": r.data_files.len(),
                })
            })
            .collect();
        return Some(json!({
            "ok": true,
            "command": "show",
            "board_type": session.board_type(),
            "board_id": session.board_id(),
            "manifest": session.manifest_path().display().to_string(),
            "results": results,
        }));
    }
    println!(
        "{}.{} ({} results)",
        session.board_type(),
        session.board_id(),
        session.results().len()
    );
    for (idx, result) in session.results().iter().enumerate() {
        println!(
            "  [{}] {} {} status={} valid={}",
            idx,
            result.start_time.to_rfc3339(),
            result.name,
            result.status_code.code(),
            result.is_valid()
        );
    }
    None
}

fn print_result(result: &ProcedureResult) {
    println!("procedure: {}", result.name);
    println!(
        "status: {} {}",
        result.status_code.code(),
        result.status_code.message()
    );
    if let Some(board) = &result.board_summary {
        println!("board: {} {}", board.status, board.desc);
    }
    let failed = result
        .channel_summary
        .iter()
        .filter(|c| c.status != 0)
        .count();
    if !result.channel_summary.is_empty() {
        println!(
            "channels: {} of {} passed",
            result.channel_summary.len() - failed,
            result.channel_summary.len()
        );
    }
    for entry in &result.data_files {
        println!("data: {} ({})", entry.path, entry.desc);
    }
    println!("valid: {}", result.is_valid());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
