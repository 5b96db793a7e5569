//! Capabilities every server carries.

use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use steward_protocol::Kwargs;
use tokio::process::Command;
use tracing::{debug, error};

use super::Extension;
use crate::context::Context;
use crate::error::{CapabilityResult, DispatchError, RegistryError};
use crate::pool::{Job, JobKind, guarded};
use crate::registry::{Call, Visibility, display_value};
use crate::server::ServerBuilder;

/// The `builtin` extension: liveness, introspection, events, jobs, shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtin;

impl Extension for Builtin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn register(&self, server: &mut ServerBuilder) -> Result<(), RegistryError> {
        server
            .capability("ping", Visibility::Public, "Check that the server is alive", ping)?
            .capability(
                "pub",
                Visibility::Public,
                "Publish an event; keyword arguments become its payload",
                publish,
            )?
            .capability("sh", Visibility::Public, "Run a program on the server", sh)?
            .capability(
                "status",
                Visibility::Public,
                "Display the currently running commands and tasks",
                status,
            )?
            .capability(
                "commands",
                Visibility::Invisible,
                "List all available server commands",
                commands,
            )?
            .capability(
                "event_handlers",
                Visibility::Invisible,
                "List registered event handlers",
                event_handlers,
            )?
            .capability("sleep", Visibility::Invisible, "Sleep t seconds, then return", sleep)?
            .capability(
                "tasks.running",
                Visibility::Public,
                "Get the list of tasks currently being run",
                running_tasks,
            )?
            .capability(
                "tasks.schedule",
                Visibility::Public,
                "Get the list of scheduled tasks",
                scheduled_tasks,
            )?
            .capability(
                "background",
                Visibility::Private,
                "Run a command without waiting for it",
                background,
            )?;
        Ok(())
    }
}

/// Renders a duration as `H:MM:SS`, with a leading `-` when negative.
pub fn format_elapsed(delta: TimeDelta) -> String {
    let sign = if delta < TimeDelta::zero() { "-" } else { "" };
    let secs = delta.num_seconds().unsigned_abs();
    format!("{sign}{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

async fn ping(_ctx: Context, _call: Call) -> CapabilityResult {
    Ok(Value::from("pong"))
}

async fn publish(ctx: Context, call: Call) -> CapabilityResult {
    let channel: String = call.required(0, "channel")?;
    let mut payload = call.kwargs;
    payload.remove("channel");
    ctx.publish(&channel, Value::Object(payload));
    Ok(Value::Bool(true))
}

async fn sh(_ctx: Context, call: Call) -> CapabilityResult {
    let mut argv: Vec<String> = call.args.iter().map(display_value).collect();
    argv.extend(
        call.kwargs
            .iter()
            .map(|(key, value)| format!("{key}={}", display_value(value))),
    );
    let Some((program, rest)) = argv.split_first() else {
        return Err(DispatchError::invalid("sh needs a program to run"));
    };

    debug!(program = %program, args = ?rest, "Running program");
    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| DispatchError::execution(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DispatchError::execution(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(Value::String(String::from_utf8_lossy(&output.stdout).into_owned()))
}

async fn commands(ctx: Context, _call: Call) -> CapabilityResult {
    let listing = ctx
        .registry()
        .listing()
        .iter()
        .map(|capability| json!([capability.name(), capability.doc()]))
        .collect();
    Ok(Value::Array(listing))
}

async fn event_handlers(ctx: Context, _call: Call) -> CapabilityResult {
    let handlers = ctx
        .events()
        .handlers()
        .iter()
        .map(|handler| {
            json!({
                "pattern": handler.pattern(),
                "name": handler.name(),
                "priority": handler.priority(),
            })
        })
        .collect();
    Ok(Value::Array(handlers))
}

async fn sleep(_ctx: Context, call: Call) -> CapabilityResult {
    let seconds: f64 = call.param_or(0, "t", 1.0)?;
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|e| DispatchError::invalid(format!("argument 't': {e}")))?;
    tokio::time::sleep(duration).await;
    Ok(Value::Bool(true))
}

fn job_lines(jobs: Vec<Job>, now: DateTime<Utc>) -> impl Iterator<Item = String> {
    jobs.into_iter()
        .map(move |job| format!("{}  {}", format_elapsed(now - job.submitted), job.label))
}

async fn status(ctx: Context, _call: Call) -> CapabilityResult {
    let now = Utc::now();
    let pool = ctx.pool();
    let mut lines: Vec<String> = vec!["Commands".into(), "--------".into()];
    lines.extend(job_lines(pool.jobs_of(JobKind::Command), now));
    lines.extend(["".into(), "Background".into(), "----------".into()]);
    lines.extend(job_lines(pool.jobs_of(JobKind::Background), now));
    lines.extend(["".into(), "Tasks".into(), "-----".into()]);
    lines.extend(job_lines(pool.jobs_of(JobKind::Task), now));
    Ok(Value::String(lines.join("\n")))
}

async fn running_tasks(ctx: Context, _call: Call) -> CapabilityResult {
    let lines: Vec<String> = ctx
        .pool()
        .jobs_of(JobKind::Task)
        .into_iter()
        .map(|job| format!("{}: {}", job.label, job.submitted.to_rfc3339()))
        .collect();
    Ok(Value::String(lines.join("\n")))
}

async fn scheduled_tasks(ctx: Context, _call: Call) -> CapabilityResult {
    let now = Utc::now();
    let lines: Vec<String> = ctx
        .tasks()
        .schedule()
        .into_iter()
        .map(|(name, next)| {
            let until = (next - now).max(TimeDelta::zero());
            format!("{name}: -{}", format_elapsed(until))
        })
        .collect();
    Ok(Value::String(lines.join("\n")))
}

async fn background(ctx: Context, call: Call) -> CapabilityResult {
    let Call { mut args, mut kwargs } = call;
    let command = if args.is_empty() {
        kwargs.remove("command")
    } else {
        Some(args.remove(0))
    };
    let command = match command {
        Some(Value::String(command)) => command,
        Some(other) => {
            return Err(DispatchError::invalid(format!(
                "argument 'command': expected a command name, got {other}"
            )));
        }
        None => return Err(DispatchError::invalid("missing argument 'command'")),
    };
    if ctx.registry().lookup(&command).is_none() {
        return Err(DispatchError::NotFound(command));
    }

    let label = Call::new(args.clone(), kwargs.clone()).signature(&command);
    let job_ctx = ctx.detached();
    ctx.pool().spawn(
        JobKind::Background,
        label,
        run_in_background(job_ctx, command, args, kwargs),
    );
    Ok(Value::Null)
}

async fn run_in_background(ctx: Context, command: String, args: Vec<Value>, kwargs: Kwargs) {
    if let Err(e) = guarded(ctx.invoke(&command, args, kwargs)).await {
        error!(command = %command, error = ?e, "Background command failed");
    }
}
