//! Job execution handler

use super::{attributes, HandlerContext};
use crate::command::shell::{self, ExecutionOutcome};
use crate::command::CommandResult;
use crate::store::JobRecord;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};
use udpu_shared::JobLog;

/// Run a job's command, then log, route and report its output
pub async fn run_job(ctx: &HandlerContext, job: &JobRecord) -> CommandResult {
    if job.command.trim().is_empty() {
        return CommandResult::Rejected {
            message: format!("job {} has no command", job.name),
        };
    }

    let command = shell::normalize_command(&job.command);
    info!("Job name: {}; command: {}", job.name, command);

    let outcome = shell::run_shell(&command).await;
    spawn_job_log(ctx, &job.name, &command, &outcome);

    if outcome.success() {
        info!("Job: {}; output: {}", job.name, outcome.stdout);
        if let Some(vbuser_id) = job.vbuser_id() {
            attributes::update_vbuser(ctx, vbuser_id, &job.job_type, &outcome.stdout).await;
        }
    } else {
        warn!(
            "Job {} exited with {}: {}",
            job.name, outcome.status_code, outcome.stderr
        );
    }

    if job.requires_output() {
        ctx.respond(outcome.response_text()).await;
    }

    if outcome.success() {
        CommandResult::Completed {
            message: outcome.stdout,
        }
    } else {
        CommandResult::Failed {
            message: outcome.stderr,
        }
    }
}

/// The job's artifacts could not be fetched; execution is skipped
pub async fn report_missing_software(ctx: &HandlerContext, job: &JobRecord) -> CommandResult {
    let message = format!("missing required software: {}", job.required_software);
    warn!("Job {}: {}", job.name, message);
    if job.requires_output() {
        ctx.respond(&message).await;
    }
    CommandResult::Rejected { message }
}

/// Post the execution record in the background
fn spawn_job_log(ctx: &HandlerContext, name: &str, command: &str, outcome: &ExecutionOutcome) {
    let log = JobLog {
        client: ctx.store.client_name().unwrap_or_default(),
        name: name.to_string(),
        command: command.to_string(),
        std_out: outcome.stdout.clone(),
        std_err: outcome.stderr.clone(),
        status_code: outcome.status_code.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };

    let client = ctx.client.clone();
    ctx.tracker.spawn(async move {
        if let Err(e) = client.send_job_log(&log).await {
            debug!("Job log for {} not delivered: {:#}", log.name, e);
        }
    });
}
