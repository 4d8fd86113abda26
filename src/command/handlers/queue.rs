//! Queue handler
//!
//! A queue names jobs; their definitions come from the server's live job
//! list, not the local store.

use super::{job, HandlerContext};
use crate::command::CommandResult;
use crate::store::{JobRecord, QueuePatch};
use tracing::{debug, info, warn};
use udpu_shared::QueueDefinition;

pub async fn handle_queue(ctx: &HandlerContext, queue: &QueueDefinition) -> CommandResult {
    if !queue.is_unlocked() {
        debug!("Dropping locked queue {}", queue.name);
        return CommandResult::Rejected {
            message: format!("queue {} is locked", queue.name),
        };
    }

    let name = queue.name.clone();
    let patch = QueuePatch::from(queue);
    if let Err(e) = ctx
        .store
        .blocking(move |store| store.upsert_queue(&name, &patch))
        .await
    {
        warn!("Failed to persist queue {}: {}", queue.name, e);
    }

    let Some(names) = queue.jobs.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
        return CommandResult::Rejected {
            message: format!("queue {} lists no jobs", queue.name),
        };
    };

    let definitions = match ctx.client.filtered_jobs(names).await {
        Ok(definitions) => definitions,
        Err(e) => {
            info!("Can't get filtered jobs for queue {}: {:#}", queue.name, e);
            return CommandResult::Failed {
                message: e.to_string(),
            };
        }
    };

    let mut executed = 0;
    for definition in &definitions {
        let job = JobRecord::from(definition);
        if !job.is_unlocked() {
            debug!("Queue {}: job {} is locked", queue.name, job.name);
            continue;
        }
        if !job.requires_output() {
            debug!("Queue {}: job {} produces no output, skipped", queue.name, job.name);
            continue;
        }
        if !ctx.software.ensure(&job.required_software()).await {
            job::report_missing_software(ctx, &job).await;
            continue;
        }

        job::run_job(ctx, &job).await;
        executed += 1;
    }

    CommandResult::Completed {
        message: format!(
            "queue {}: {} of {} jobs executed",
            queue.name,
            executed,
            definitions.len()
        ),
    }
}
