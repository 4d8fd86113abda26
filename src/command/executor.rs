//! Job executor - decodes push messages and dispatches them to handlers

use super::handlers::{self, HandlerContext};
use super::scheduler::JobScheduler;
use crate::store::{ClientPatch, FrequencyFilter, JobPatch, JobRecord};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use udpu_shared::boot_status::{EVERY_BOOT, FIRST_BOOT};
use udpu_shared::{codec, DeviceDescriptor, JobDefinition, PushMessage};

/// Result of handling a job or queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Command ran and exited successfully
    Completed { message: String },
    /// Command ran but exited non-zero
    Failed { message: String },
    /// Nothing was executed (locked, missing software, bad message)
    Rejected { message: String },
}

/// Executes jobs and queues received over the push channel or at boot
pub struct JobExecutor {
    ctx: HandlerContext,
    scheduler: JobScheduler,
    this: Weak<JobExecutor>,
}

impl JobExecutor {
    pub fn new(ctx: HandlerContext, token: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            scheduler: JobScheduler::new(token, ctx.tracker.clone()),
            ctx,
            this: this.clone(),
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Handle a push message on its own task
    pub fn dispatch(self: &Arc<Self>, text: String) {
        let executor = Arc::clone(self);
        self.ctx.tracker.spawn(async move {
            let result = executor.handle_message(&text).await;
            debug!("Push message handled: {:?}", result);
        });
    }

    pub async fn handle_message(&self, text: &str) -> CommandResult {
        match codec::decode(text) {
            Ok(PushMessage::Job(job)) => self.handle_job(&job).await,
            Ok(PushMessage::Queue(queue)) => handlers::handle_queue(&self.ctx, &queue).await,
            Err(e) => {
                info!("Error decoding push message: {}", e);
                CommandResult::Rejected {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Fetch software, persist, (re)schedule, then run the job once
    pub async fn handle_job(&self, definition: &JobDefinition) -> CommandResult {
        if !definition.is_unlocked() {
            debug!("Dropping locked job {}", definition.name);
            return CommandResult::Rejected {
                message: format!("job {} is locked", definition.name),
            };
        }

        let software_ready = self
            .ctx
            .software
            .ensure(&definition.required_software())
            .await;

        let name = definition.name.clone();
        let patch = JobPatch::from(definition);
        let job = match self
            .ctx
            .store
            .blocking(move |store| store.upsert_job(&name, &patch))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!("Failed to persist job {}: {}", definition.name, e);
                JobRecord::from(definition)
            }
        };
        self.schedule(&job);

        if !software_ready {
            return handlers::report_missing_software(&self.ctx, &job).await;
        }
        handlers::run_job(&self.ctx, &job).await
    }

    /// Boot-time job processing once the device runtime starts
    pub async fn process_boot(&self, descriptor: &DeviceDescriptor) {
        let first_boot = self
            .ctx
            .store
            .client()
            .map_or(true, |client| client.boot_status.is_empty());
        let boot_status = if first_boot { FIRST_BOOT } else { EVERY_BOOT };
        info!("Boot processing: {}", boot_status);

        let patch = ClientPatch::from_descriptor(descriptor, boot_status);
        let role = match self
            .ctx
            .store
            .blocking(move |store| store.upsert_client(&patch))
            .await
        {
            Ok(client) => client.udpu_role,
            Err(e) => {
                warn!("Failed to persist client record: {}", e);
                descriptor.role.clone()
            }
        };

        let fetched = if first_boot {
            self.ctx.client.role_jobs(&role).await
        } else {
            self.ctx.client.every_boot_jobs().await
        };
        match fetched {
            Ok(definitions) => self.store_definitions(definitions).await,
            Err(e) => info!("Can't get {} jobs: {:#}", boot_status, e),
        }

        for job in self.ctx.store.jobs_matching(FrequencyFilter::Exact(boot_status)) {
            if !job.is_unlocked() {
                continue;
            }
            let ctx = self.ctx.clone();
            self.ctx.tracker.spawn(async move {
                handlers::run_job(&ctx, &job).await;
            });
        }

        for job in self.ctx.store.jobs_matching(FrequencyFilter::Scheduled) {
            self.schedule(&job);
        }
    }

    async fn store_definitions(&self, definitions: Vec<JobDefinition>) {
        let stored = self
            .ctx
            .store
            .blocking(move |store| {
                for definition in definitions.iter().filter(|d| !d.name.is_empty()) {
                    let patch = JobPatch::from(definition);
                    if let Err(e) = store.upsert_job(&definition.name, &patch) {
                        warn!("Failed to persist job {}: {}", definition.name, e);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = stored {
            warn!("Failed to persist fetched jobs: {}", e);
        }
    }

    /// Register, replace or drop the periodic timer of a job.
    ///
    /// Each tick re-reads the job so later updates and locks take effect.
    fn schedule(&self, job: &JobRecord) -> bool {
        if !job.is_unlocked() {
            self.scheduler.unschedule(&job.name);
            return false;
        }

        let this = self.this.clone();
        let name = job.name.clone();
        self.scheduler.schedule(&job.name, &job.frequency(), move || {
            let this = this.clone();
            let name = name.clone();
            async move {
                if let Some(executor) = this.upgrade() {
                    executor.run_stored(&name).await;
                }
            }
        })
    }

    async fn run_stored(&self, name: &str) {
        match self.ctx.store.job(name) {
            Some(job) if job.is_unlocked() => {
                handlers::run_job(&self.ctx, &job).await;
            }
            Some(_) => debug!("Job {} is locked, tick skipped", name),
            None => debug!("Job {} no longer stored, tick skipped", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, ServiceAddr};
    use crate::software::SoftwareFetcher;
    use crate::store::Store;
    use crate::transport::{ControlPlaneClient, ResponseSink};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::task::TaskTracker;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        responses: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn responses(&self) -> Vec<String> {
            self.responses.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn send_response(&self, output: &str) -> Result<()> {
            self.responses.lock().unwrap().push(output.to_string());
            Ok(())
        }
    }

    struct Fixture {
        executor: Arc<JobExecutor>,
        sink: Arc<RecordingSink>,
        store: Arc<Store>,
        tracker: TaskTracker,
        token: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn new(server: &MockServer) -> Self {
            Mock::given(method("POST"))
                .and(path("/api/v1.0/logs/jobs"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let a = server.address();
            let addr = ServiceAddr::new(a.ip().to_string(), a.port());
            let client = ControlPlaneClient::new(
                Endpoints {
                    server: addr.clone(),
                    repo: addr,
                },
                Duration::from_secs(2),
            )
            .unwrap();

            let store = Arc::new(Store::open(dir.path().join("s.json")).unwrap());
            let sink = Arc::new(RecordingSink::default());
            let tracker = TaskTracker::new();
            let token = CancellationToken::new();
            let ctx = HandlerContext {
                store: store.clone(),
                software: SoftwareFetcher::new(client.clone(), dir.path()),
                client,
                sink: sink.clone(),
                tracker: tracker.clone(),
            };

            Self {
                executor: JobExecutor::new(ctx, token.clone()),
                sink,
                store,
                tracker,
                token,
                _dir: dir,
            }
        }

        async fn settle(&self) {
            self.token.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    #[tokio::test]
    async fn test_job_message_executes_and_responds() {
        let server = MockServer::start().await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"job","name":"ping","command":"echo hi","locked":"false","require_output":"true","frequency":"once","required_software":"none"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert_eq!(
            result,
            CommandResult::Completed {
                message: "hi".into()
            }
        );
        let stored = fx.store.job("ping").unwrap();
        assert_eq!(stored.command, "echo hi");
        assert_eq!(stored.frequency, "once");
        assert_eq!(fx.sink.responses(), vec!["hi".to_string()]);
        assert_eq!(
            codec::encode_response(&fx.sink.responses()[0]).unwrap(),
            r#"{"response":"hi"}"#
        );
        assert!(!fx.executor.scheduler().is_scheduled("ping"));
    }

    #[tokio::test]
    async fn test_locked_job_is_dropped() {
        let server = MockServer::start().await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"job","name":"ping","command":"echo hi","locked":"true","require_output":"true","frequency":"1"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert!(matches!(result, CommandResult::Rejected { .. }));
        assert!(fx.store.job("ping").is_none());
        assert!(fx.sink.responses().is_empty());
        assert!(!fx.executor.scheduler().is_scheduled("ping"));
    }

    #[tokio::test]
    async fn test_periodic_job_is_scheduled() {
        let server = MockServer::start().await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"job","name":"uptime","command":"echo up","locked":"false","require_output":"false","frequency":"15"}"#;
        let result = fx.executor.handle_message(text).await;

        assert!(matches!(result, CommandResult::Completed { .. }));
        assert!(fx.executor.scheduler().is_scheduled("uptime"));
        assert!(fx.sink.responses().is_empty());

        // Moving to a one-shot frequency drops the timer
        let text = r#"{"action_type":"job","name":"uptime","locked":"false","frequency":"once"}"#;
        fx.executor.handle_message(text).await;
        assert!(!fx.executor.scheduler().is_scheduled("uptime"));

        fx.settle().await;
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let server = MockServer::start().await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"job","name":"bad","command":"echo oops >&2; exit 3","locked":"false","require_output":"true","frequency":"once"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert_eq!(
            result,
            CommandResult::Failed {
                message: "oops".into()
            }
        );
        assert_eq!(fx.sink.responses(), vec!["oops".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_software_skips_execution() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/repo/tool"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let fx = Fixture::new(&server).await;

        let marker = fx._dir.path().join("ran");
        let text = json!({
            "action_type": "job",
            "name": "needs-tool",
            "command": format!("touch {}", marker.display()),
            "locked": "false",
            "require_output": "true",
            "frequency": "once",
            "required_software": "tool",
        })
        .to_string();
        let result = fx.executor.handle_message(&text).await;
        fx.settle().await;

        assert!(matches!(result, CommandResult::Rejected { .. }));
        assert!(fx.store.job("needs-tool").is_some());
        assert!(!marker.exists());
        assert_eq!(
            fx.sink.responses(),
            vec!["missing required software: tool".to_string()]
        );
    }

    #[tokio::test]
    async fn test_vbuser_attributes_routed() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1.0/vbuser/42"))
            .and(body_json(json!({"lq_max_rate": "100", "lq_current_rate": "100"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"job","name":"rate","command":"echo 100","locked":"false","require_output":"false","frequency":"once","type":"update_max_rate","vbuser_id":"42"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert!(matches!(result, CommandResult::Completed { .. }));
        assert!(fx.sink.responses().is_empty());
    }

    #[tokio::test]
    async fn test_queue_runs_jobs_requiring_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/jobs/"))
            .and(query_param("filter_by", "a,b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "a", "command": "echo from-a", "require_output": "true", "locked": "false"},
                {"name": "b", "command": "echo from-b", "require_output": "false", "locked": "false"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"queue","name":"q1","jobs":"a,b","locked":"false"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert!(matches!(result, CommandResult::Completed { .. }));
        assert_eq!(fx.sink.responses(), vec!["from-a".to_string()]);
        assert_eq!(fx.store.queue("q1").unwrap().queue, "a,b");
        assert!(fx.store.job("a").is_none());
    }

    #[tokio::test]
    async fn test_locked_queue_is_dropped() {
        let server = MockServer::start().await;
        let marker_dir = tempfile::tempdir().unwrap();
        let marker = marker_dir.path().join("ran");
        Mock::given(method("GET"))
            .and(path("/api/v1.0/jobs/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "a", "command": format!("touch {}", marker.display()), "require_output": "true", "locked": "false"}
            ])))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1.0/logs/jobs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let fx = Fixture::new(&server).await;

        let text = r#"{"action_type":"queue","name":"q1","jobs":"a","locked":"true"}"#;
        let result = fx.executor.handle_message(text).await;
        fx.settle().await;

        assert_eq!(
            result,
            CommandResult::Rejected {
                message: "queue q1 is locked".into()
            }
        );
        assert!(fx.sink.responses().is_empty());
        assert!(fx.store.queue("q1").is_none());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_malformed_message_rejected() {
        let server = MockServer::start().await;
        let fx = Fixture::new(&server).await;

        let result = fx.executor.handle_message(r#"{"name":"x"}"#).await;
        fx.settle().await;

        assert!(matches!(result, CommandResult::Rejected { .. }));
        assert!(fx.sink.responses().is_empty());
    }

    #[tokio::test]
    async fn test_boot_processing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/roles/edge/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "init", "command": "echo booted", "frequency": "first_boot", "require_output": "true", "locked": "false"},
                {"name": "poll", "command": "echo poll", "frequency": "60", "require_output": "false", "locked": "false"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/jobs/frequency/every_boot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "again", "command": "echo again", "frequency": "every_boot", "require_output": "true", "locked": "false"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let fx = Fixture::new(&server).await;

        let descriptor = DeviceDescriptor {
            subscriber_uid: "sub-1".into(),
            role: "edge".into(),
            hostname: "udpu-1".into(),
            ..Default::default()
        };

        fx.executor.process_boot(&descriptor).await;
        let client = fx.store.client().unwrap();
        assert_eq!(client.boot_status, FIRST_BOOT);
        assert_eq!(client.name, "sub-1");
        assert_eq!(client.udpu_role, "edge");
        assert!(fx.store.job("init").is_some());
        assert!(fx.executor.scheduler().is_scheduled("poll"));

        fx.executor.process_boot(&descriptor).await;
        assert_eq!(fx.store.client().unwrap().boot_status, EVERY_BOOT);
        assert!(fx.store.job("again").is_some());

        fx.settle().await;

        let mut responses = fx.sink.responses();
        responses.sort();
        assert_eq!(responses, vec!["again".to_string(), "booted".to_string()]);
    }
}
