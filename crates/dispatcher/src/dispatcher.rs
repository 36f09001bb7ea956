//! Per-recipient template notification dispatch.
//!
//! For one notification job:
//! 1. Check the job is submitted and not already `Error`/`Finished`
//! 2. Resolve app, locale, source document, template data, URL and template id
//! 3. Send the template message to every recipient still in `New`
//! 4. Recompute the job status from this pass and persist once
//!
//! Nothing escapes [`NotificationDispatcher::dispatch`]: failures are logged
//! and recorded on the job or the recipient.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use relay_common::config::{DispatchGuard, DispatchOptions, FinishPolicy};
use relay_common::error::DispatchError;
use relay_common::types::{
    DocStatus, JobStatus, NotificationJob, Recipient, RecipientStatus, TemplateMessage, WechatApp,
};
use relay_wechat::{TemplateMessenger, oauth};

use crate::documents::TemplateSource;
use crate::links::redirect_url;
use crate::lock::DispatchLock;
use crate::store::{AppDirectory, BindingDirectory, DocumentStore, JobStore};
use crate::templates::template_key;

/// Collaborators the dispatcher works through.
#[derive(Clone)]
pub struct DispatchPorts {
    pub jobs: Arc<dyn JobStore>,
    pub apps: Arc<dyn AppDirectory>,
    pub documents: Arc<dyn DocumentStore>,
    pub bindings: Arc<dyn BindingDirectory>,
    pub messenger: Arc<dyn TemplateMessenger>,
    pub lock: Arc<dyn DispatchLock>,
}

/// What a dispatch call did. Informational only; the job record is the
/// source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    JobNotFound,
    NotSubmitted,
    AlreadyTerminal,
    /// Another dispatch holds the claim on this job.
    Claimed,
    LockUnavailable,
    /// The job could not be prepared. `recorded` is false for store failures,
    /// which leave the job untouched for the next sweep.
    Failed { error: String, recorded: bool },
    Completed {
        status: JobStatus,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Everything resolved once per job before any recipient is attempted.
struct Prepared {
    app: WechatApp,
    template_id: String,
    url: String,
    data: Value,
}

enum Delivery {
    Skipped,
    Succeeded,
    Failed,
}

pub struct NotificationDispatcher {
    ports: DispatchPorts,
    options: DispatchOptions,
    system_language: String,
}

impl NotificationDispatcher {
    pub fn new(ports: DispatchPorts, options: DispatchOptions, system_language: impl Into<String>) -> Self {
        Self {
            ports,
            options,
            system_language: system_language.into(),
        }
    }

    /// Load and dispatch a job by id.
    pub async fn dispatch(&self, job_id: Uuid) -> DispatchOutcome {
        match self.ports.jobs.load(job_id).await {
            Ok(Some(job)) => self.dispatch_job(job).await,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Notification job not found");
                DispatchOutcome::JobNotFound
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load notification job");
                DispatchOutcome::Failed {
                    error: e.to_string(),
                    recorded: false,
                }
            }
        }
    }

    /// Dispatch an already loaded job.
    ///
    /// Under the claim guard the pass runs on the record reloaded after the
    /// claim, not on `job`, which may predate another pass.
    pub async fn dispatch_job(&self, mut job: NotificationJob) -> DispatchOutcome {
        if let Some(outcome) = skip_reason(&job) {
            return outcome;
        }

        if self.options.guard != DispatchGuard::Claim {
            return self.run(&mut job).await;
        }

        match self.ports.lock.try_claim(job.id, self.options.claim_ttl_secs).await {
            Ok(true) => {}
            Ok(false) => return DispatchOutcome::Claimed,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to claim job");
                return DispatchOutcome::LockUnavailable;
            }
        }

        let outcome = match self.reload(job.id).await {
            Ok(mut current) => match skip_reason(&current) {
                Some(outcome) => outcome,
                None => self.run(&mut current).await,
            },
            Err(outcome) => outcome,
        };

        if let Err(e) = self.ports.lock.release(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to release job claim");
        }

        outcome
    }

    async fn reload(&self, job_id: Uuid) -> Result<NotificationJob, DispatchOutcome> {
        match self.ports.jobs.load(job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Notification job disappeared");
                Err(DispatchOutcome::JobNotFound)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to reload notification job");
                Err(DispatchOutcome::Failed {
                    error: e.to_string(),
                    recorded: false,
                })
            }
        }
    }

    async fn run(&self, job: &mut NotificationJob) -> DispatchOutcome {
        let prepared = match self.prepare(job).await {
            Ok(prepared) => prepared,
            Err(DispatchError::Store(e)) => {
                tracing::error!(job_id = %job.id, error = %e, "Store failure while preparing job");
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                    recorded: false,
                };
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Cannot dispatch job");
                job.set_error(e.to_string());
                self.persist(job).await;
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                    recorded: true,
                };
            }
        };

        // The persisted record may have moved on while we were resolving.
        match self.reload(job.id).await {
            Ok(current) => {
                if let Some(outcome) = skip_reason(&current) {
                    tracing::info!(job_id = %job.id, status = %current.status, "Job changed concurrently, skipping");
                    return outcome;
                }
                *job = current;
            }
            Err(outcome) => return outcome,
        }

        let (mut succeeded, mut failed, mut skipped) = (0, 0, 0);
        for recipient in job.recipients.iter_mut() {
            match self.deliver(&prepared, recipient).await {
                Delivery::Succeeded => succeeded += 1,
                Delivery::Failed => failed += 1,
                Delivery::Skipped => skipped += 1,
            }
        }

        job.status = aggregate_status(self.options.finish_policy, job.status, &job.recipients, succeeded);
        self.persist(job).await;

        tracing::info!(
            job_id = %job.id,
            app = %job.app,
            status = %job.status,
            succeeded,
            failed,
            skipped,
            "Notification job dispatched"
        );

        DispatchOutcome::Completed {
            status: job.status,
            succeeded,
            failed,
            skipped,
        }
    }

    async fn prepare(&self, job: &NotificationJob) -> Result<Prepared, DispatchError> {
        let app = self
            .ports
            .apps
            .get_app(&job.app)
            .await?
            .ok_or_else(|| DispatchError::Configuration(format!("Cannot find wechat app {}", job.app)))?;

        let locale = app
            .language
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.system_language)
            .to_string();

        let doc = self
            .ports
            .documents
            .get_document(job.document_type, &job.document_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                document_type: job.document_type.to_string(),
                document_id: job.document_id.clone(),
            })?;

        let data = doc
            .template_data(&locale)
            .filter(|d| !is_empty_value(d))
            .ok_or_else(|| DispatchError::DataGeneration {
                document_type: job.document_type.to_string(),
                what: "data",
            })?;

        let target = doc
            .target_url(&locale)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DispatchError::DataGeneration {
                document_type: job.document_type.to_string(),
                what: "url",
            })?;

        let redirect = redirect_url(&app.domain, &target, &job.app)?;

        let template_id = template_key(job.document_type)
            .and_then(|key| app.template_id(key))
            .map(str::to_string)
            .ok_or_else(|| {
                DispatchError::Configuration(format!(
                    "Cannot find wechat template id for {} from app {}",
                    job.document_type, job.app
                ))
            })?;

        let url = oauth::authorize_url(&app.app_id, &redirect)
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;

        Ok(Prepared {
            app,
            template_id,
            url,
            data,
        })
    }

    async fn deliver(&self, prepared: &Prepared, recipient: &mut Recipient) -> Delivery {
        if recipient.status != RecipientStatus::New {
            return Delivery::Skipped;
        }

        let app = &prepared.app;
        tracing::info!(
            template_id = %prepared.template_id,
            user = %recipient.user_ref,
            app = %app.name,
            "Sending template message"
        );

        let openid = match self.ports.bindings.openid(&app.name, &recipient.user_ref).await {
            Ok(Some(openid)) => openid,
            Ok(None) => {
                let info = format!("User {} has not bound their wechat", recipient.user_ref);
                tracing::warn!(user = %recipient.user_ref, app = %app.name, "{}", info);
                recipient.record_attempt(RecipientStatus::Error, info);
                return Delivery::Failed;
            }
            Err(e) => {
                tracing::error!(user = %recipient.user_ref, error = %e, "Binding lookup failed");
                recipient.record_attempt(RecipientStatus::Error, e.to_string());
                return Delivery::Failed;
            }
        };

        let message = TemplateMessage {
            touser: openid,
            template_id: prepared.template_id.clone(),
            url: prepared.url.clone(),
            data: prepared.data.clone(),
        };

        match self.ports.messenger.send_template(app, &message).await {
            Ok(response) if response.is_ok() => {
                tracing::debug!(user = %recipient.user_ref, response = %response, "Template message sent");
                recipient.record_attempt(RecipientStatus::Finished, format!("result: {}", response));
                Delivery::Succeeded
            }
            Ok(response) => {
                tracing::error!(user = %recipient.user_ref, response = %response, "Template message rejected");
                recipient.record_attempt(RecipientStatus::Error, format!("result: {}", response));
                Delivery::Failed
            }
            Err(e) => {
                let error = DispatchError::RemoteCall(e.to_string());
                tracing::error!(user = %recipient.user_ref, error = %error, "Template message failed");
                recipient.record_attempt(RecipientStatus::Error, error.to_string());
                Delivery::Failed
            }
        }
    }

    async fn persist(&self, job: &NotificationJob) {
        if let Err(e) = self.ports.jobs.save(job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to save notification job");
        }
    }
}

/// Why a job must not be dispatched, if it must not.
fn skip_reason(job: &NotificationJob) -> Option<DispatchOutcome> {
    if job.doc_status != DocStatus::Submitted {
        tracing::debug!(job_id = %job.id, "Job not submitted, skipping");
        return Some(DispatchOutcome::NotSubmitted);
    }
    if job.status.is_terminal() {
        tracing::debug!(job_id = %job.id, status = %job.status, "Job already terminal, skipping");
        return Some(DispatchOutcome::AlreadyTerminal);
    }
    None
}

/// Job status after a pass in which `fresh_successes` recipients succeeded.
pub fn aggregate_status(
    policy: FinishPolicy,
    previous: JobStatus,
    recipients: &[Recipient],
    fresh_successes: usize,
) -> JobStatus {
    match policy {
        FinishPolicy::FreshPass => {
            let mut status = previous;
            if fresh_successes > 0 {
                status = JobStatus::Partial;
            }
            if fresh_successes == recipients.len() {
                status = JobStatus::Finished;
            }
            status
        }
        FinishPolicy::AllTerminal => {
            if recipients.iter().all(|r| r.status == RecipientStatus::Finished) {
                JobStatus::Finished
            } else if recipients.iter().any(|r| r.status == RecipientStatus::Finished) {
                JobStatus::Partial
            } else {
                previous
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_common::types::DocumentType;

    use crate::documents::{DeviceEvent, SourceDocument, ToDo};
    use crate::mock::{
        MockAppDirectory, MockBindingDirectory, MockDispatchLock, MockDocumentStore, MockJobStore,
        MockMessenger, MockReply,
    };

    const APP: &str = "demo";

    struct Harness {
        jobs: MockJobStore,
        apps: MockAppDirectory,
        documents: MockDocumentStore,
        bindings: MockBindingDirectory,
        messenger: MockMessenger,
        lock: MockDispatchLock,
    }

    impl Harness {
        fn new() -> Self {
            let h = Self {
                jobs: MockJobStore::new(),
                apps: MockAppDirectory::new(),
                documents: MockDocumentStore::new(),
                bindings: MockBindingDirectory::new(),
                messenger: MockMessenger::new(),
                lock: MockDispatchLock::new(),
            };
            h.apps.add_app(make_app(None));
            h.documents.add_document(
                DocumentType::IotDeviceEvent,
                "EV-1",
                SourceDocument::DeviceEvent(make_event("EV-1")),
            );
            h
        }

        fn dispatcher(&self, options: DispatchOptions) -> NotificationDispatcher {
            NotificationDispatcher::new(
                DispatchPorts {
                    jobs: Arc::new(self.jobs.clone()),
                    apps: Arc::new(self.apps.clone()),
                    documents: Arc::new(self.documents.clone()),
                    bindings: Arc::new(self.bindings.clone()),
                    messenger: Arc::new(self.messenger.clone()),
                    lock: Arc::new(self.lock.clone()),
                },
                options,
                "en",
            )
        }

        fn default_dispatcher(&self) -> NotificationDispatcher {
            self.dispatcher(DispatchOptions::default())
        }

        /// Persist a submitted job for the seeded device event.
        fn submitted_job(&self, users: &[&str]) -> NotificationJob {
            let mut job = NotificationJob::new(
                APP,
                DocumentType::IotDeviceEvent,
                "EV-1",
                users.iter().map(|u| u.to_string()),
            );
            job.doc_status = DocStatus::Submitted;
            self.jobs.insert(job.clone());
            job
        }
    }

    fn make_app(language: Option<&str>) -> WechatApp {
        WechatApp {
            name: APP.to_string(),
            app_id: "wx0001".to_string(),
            secret: "secret".to_string(),
            domain: "iot.example.com".to_string(),
            language: language.map(str::to_string),
            device_alarm_template: Some("tpl-alarm".to_string()),
            tickets_ticket_template: None,
        }
    }

    fn make_event(name: &str) -> DeviceEvent {
        DeviceEvent {
            name: name.to_string(),
            device: "GW-2001".to_string(),
            title: "Modbus link lost".to_string(),
            event_type: "Comm".to_string(),
            event_level: 3,
            event_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unsubmitted_job_is_noop() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let mut job = h.submitted_job(&["alice"]);
        job.doc_status = DocStatus::Draft;
        h.jobs.insert(job.clone());

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(outcome, DispatchOutcome::NotSubmitted);
        assert!(h.jobs.saves().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_noop() {
        for status in [JobStatus::Finished, JobStatus::Error] {
            let h = Harness::new();
            h.bindings.bind(APP, "alice", "openid-alice");
            let mut job = h.submitted_job(&["alice"]);
            job.status = status;
            h.jobs.insert(job.clone());

            let outcome = h.default_dispatcher().dispatch(job.id).await;

            assert_eq!(outcome, DispatchOutcome::AlreadyTerminal);
            assert!(h.jobs.saves().is_empty());
            assert!(h.messenger.sent().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unbound_recipient_makes_job_partial() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.bindings.bind(APP, "bob", "openid-bob");
        let job = h.submitted_job(&["alice", "carol", "bob"]);

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                status: JobStatus::Partial,
                succeeded: 2,
                failed: 1,
                skipped: 0,
            }
        );
        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.status, JobStatus::Partial);
        assert_eq!(h.jobs.saves().len(), 1);

        let [alice, carol, bob] = saved.recipients.as_slice() else {
            panic!("expected three recipients");
        };
        for r in [alice, bob] {
            assert!(r.sent);
            assert_eq!(r.status, RecipientStatus::Finished);
            assert!(r.info.as_deref().unwrap().starts_with("result: "));
        }
        assert!(carol.sent);
        assert_eq!(carol.status, RecipientStatus::Error);
        assert!(carol.info.as_deref().unwrap().contains("not bound"));

        let sent: Vec<String> = h.messenger.sent().into_iter().map(|m| m.touser).collect();
        assert_eq!(sent, vec!["openid-alice", "openid-bob"]);
    }

    #[tokio::test]
    async fn test_all_successful_job_is_finished() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.bindings.bind(APP, "bob", "openid-bob");
        let job = h.submitted_job(&["alice", "bob"]);

        h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_thrown_send_failure_without_successes_keeps_status() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.messenger.reply("openid-alice", MockReply::Fail("connection reset".to_string()));
        let job = h.submitted_job(&["alice"]);

        h.default_dispatcher().dispatch(job.id).await;

        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.status, JobStatus::New);
        assert_eq!(h.jobs.saves().len(), 1);
        let alice = &saved.recipients[0];
        assert!(alice.sent);
        assert_eq!(alice.status, RecipientStatus::Error);
        assert!(alice.info.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_thrown_send_failure_with_other_success_is_partial() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.bindings.bind(APP, "bob", "openid-bob");
        h.messenger.reply("openid-alice", MockReply::Fail("timeout".to_string()));
        let job = h.submitted_job(&["alice", "bob"]);

        h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Partial);
    }

    #[tokio::test]
    async fn test_nonzero_errcode_marks_recipient_error() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.messenger.reply("openid-alice", MockReply::ErrCode(43004));
        let job = h.submitted_job(&["alice"]);

        h.default_dispatcher().dispatch(job.id).await;

        let alice = &h.jobs.get(job.id).unwrap().recipients[0];
        assert!(alice.sent);
        assert_eq!(alice.status, RecipientStatus::Error);
        assert!(alice.info.as_deref().unwrap().contains("errcode: 43004"));
    }

    #[tokio::test]
    async fn test_missing_document_marks_job_error() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let mut job = h.submitted_job(&["alice"]);
        job.document_id = "EV-404".to_string();
        h.jobs.insert(job.clone());

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { recorded: true, .. }));
        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.status, JobStatus::Error);
        assert_eq!(
            saved.error_info.as_deref(),
            Some("Cannot find doc IOT Device Event id EV-404")
        );
        assert_eq!(saved.recipients, job.recipients);
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_url_marks_job_error() {
        let h = Harness::new();
        h.documents.add_document(
            DocumentType::IotDeviceEvent,
            "EV-1",
            SourceDocument::DeviceEvent(make_event("")),
        );
        let job = h.submitted_job(&["alice"]);

        h.default_dispatcher().dispatch(job.id).await;

        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.status, JobStatus::Error);
        assert_eq!(
            saved.error_info.as_deref(),
            Some("Cannot generate wechat template url for IOT Device Event")
        );
    }

    #[tokio::test]
    async fn test_missing_template_id_marks_job_error() {
        let h = Harness::new();
        h.documents.add_document(
            DocumentType::ToDo,
            "TD-1",
            SourceDocument::ToDo(ToDo {
                name: "TD-1".to_string(),
                description: "Replace battery".to_string(),
                owner: None,
                date: None,
                reference_type: None,
                reference_name: None,
            }),
        );
        let mut job = h.submitted_job(&["alice"]);
        job.document_type = DocumentType::ToDo;
        job.document_id = "TD-1".to_string();
        h.jobs.insert(job.clone());

        h.default_dispatcher().dispatch(job.id).await;

        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.status, JobStatus::Error);
        assert_eq!(
            saved.error_info.as_deref(),
            Some("Cannot find wechat template id for ToDo from app demo")
        );
    }

    #[tokio::test]
    async fn test_second_dispatch_of_finished_job_changes_nothing() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        let dispatcher = h.default_dispatcher();

        dispatcher.dispatch(job.id).await;
        let after_first = h.jobs.get(job.id).unwrap();
        let outcome = dispatcher.dispatch(job.id).await;

        assert_eq!(outcome, DispatchOutcome::AlreadyTerminal);
        assert_eq!(h.jobs.get(job.id).unwrap(), after_first);
        assert_eq!(h.jobs.saves().len(), 1);
        assert_eq!(h.messenger.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_handled_recipients_are_not_retried() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.bindings.bind(APP, "bob", "openid-bob");
        let mut job = h.submitted_job(&["alice", "bob"]);
        job.recipients[0].record_attempt(RecipientStatus::Error, "earlier failure");
        h.jobs.insert(job.clone());

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                status: JobStatus::Partial,
                succeeded: 1,
                failed: 0,
                skipped: 1,
            }
        );
        let saved = h.jobs.get(job.id).unwrap();
        assert_eq!(saved.recipients[0], job.recipients[0]);
        let sent: Vec<String> = h.messenger.sent().into_iter().map(|m| m.touser).collect();
        assert_eq!(sent, vec!["openid-bob"]);
    }

    #[tokio::test]
    async fn test_fresh_pass_policy_never_finishes_after_earlier_pass() {
        let h = Harness::new();
        h.bindings.bind(APP, "bob", "openid-bob");
        let mut job = h.submitted_job(&["alice", "bob"]);
        job.recipients[0].record_attempt(RecipientStatus::Finished, "result: ok");
        h.jobs.insert(job.clone());

        h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Partial);
    }

    #[tokio::test]
    async fn test_all_terminal_policy_finishes_across_passes() {
        let h = Harness::new();
        h.bindings.bind(APP, "bob", "openid-bob");
        let mut job = h.submitted_job(&["alice", "bob"]);
        job.recipients[0].record_attempt(RecipientStatus::Finished, "result: ok");
        h.jobs.insert(job.clone());

        let options = DispatchOptions {
            finish_policy: FinishPolicy::AllTerminal,
            ..DispatchOptions::default()
        };
        h.dispatcher(options).dispatch(job.id).await;

        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_held_claim_makes_dispatch_noop() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        h.lock.hold(job.id);

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(outcome, DispatchOutcome::Claimed);
        assert!(h.messenger.sent().is_empty());
        assert!(h.jobs.saves().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_released_after_dispatch() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);

        h.default_dispatcher().dispatch(job.id).await;

        assert!(!h.lock.is_held(job.id));
    }

    #[tokio::test]
    async fn test_recheck_guard_skips_job_finished_concurrently() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        h.jobs.set_status(job.id, JobStatus::Finished);

        let options = DispatchOptions {
            guard: DispatchGuard::Recheck,
            ..DispatchOptions::default()
        };
        // The caller still holds the stale `New` snapshot.
        let outcome = h.dispatcher(options).dispatch_job(job).await;

        assert_eq!(outcome, DispatchOutcome::AlreadyTerminal);
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_message_uses_system_language_and_oauth_url() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);

        let dispatcher = NotificationDispatcher::new(
            DispatchPorts {
                jobs: Arc::new(h.jobs.clone()),
                apps: Arc::new(h.apps.clone()),
                documents: Arc::new(h.documents.clone()),
                bindings: Arc::new(h.bindings.clone()),
                messenger: Arc::new(h.messenger.clone()),
                lock: Arc::new(h.lock.clone()),
            },
            DispatchOptions::default(),
            "zh-cn",
        );
        dispatcher.dispatch(job.id).await;

        let message = &h.messenger.sent()[0];
        assert_eq!(message.template_id, "tpl-alarm");
        assert_eq!(message.data["first"]["value"], "设备告警");
        assert!(message.url.starts_with(
            "https://open.weixin.qq.com/connect/oauth2/authorize?appid=wx0001&redirect_uri=http%3A%2F%2Fiot.example.com%2Fwechat_redirect%3F"
        ));
        assert!(message.url.ends_with("#wechat_redirect"));
    }

    #[tokio::test]
    async fn test_app_language_overrides_system_language() {
        let h = Harness::new();
        h.apps.add_app(make_app(Some("zh-cn")));
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);

        h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(h.messenger.sent()[0].data["first"]["value"], "设备告警");
    }

    #[tokio::test]
    async fn test_missing_job_is_reported() {
        let h = Harness::new();
        let outcome = h.default_dispatcher().dispatch(Uuid::new_v4()).await;
        assert_eq!(outcome, DispatchOutcome::JobNotFound);
    }

    #[tokio::test]
    async fn test_stale_snapshot_after_partial_pass_resends_nothing() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let stale = h.submitted_job(&["alice", "carol"]);
        let dispatcher = h.default_dispatcher();

        let first = dispatcher.dispatch(stale.id).await;
        assert!(matches!(first, DispatchOutcome::Completed { status: JobStatus::Partial, .. }));
        let after_first = h.jobs.get(stale.id).unwrap();

        let second = dispatcher.dispatch_job(stale).await;

        assert_eq!(
            second,
            DispatchOutcome::Completed {
                status: JobStatus::Partial,
                succeeded: 0,
                failed: 0,
                skipped: 2,
            }
        );
        assert_eq!(h.messenger.sent().len(), 1);
        assert_eq!(h.jobs.get(after_first.id).unwrap().recipients, after_first.recipients);
    }

    #[tokio::test]
    async fn test_recheck_guard_uses_persisted_recipients() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let stale = h.submitted_job(&["alice", "carol"]);
        let options = DispatchOptions {
            guard: DispatchGuard::Recheck,
            ..DispatchOptions::default()
        };
        let dispatcher = h.dispatcher(options);

        dispatcher.dispatch(stale.id).await;
        let after_first = h.jobs.get(stale.id).unwrap();
        let second = dispatcher.dispatch_job(stale).await;

        assert!(matches!(second, DispatchOutcome::Completed { skipped: 2, .. }));
        assert_eq!(h.messenger.sent().len(), 1);
        assert_eq!(h.jobs.get(after_first.id).unwrap().recipients, after_first.recipients);
    }

    #[tokio::test]
    async fn test_load_failure_after_claim_leaves_job_untouched() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        h.jobs.fail_loads("connection refused");

        let outcome = h.default_dispatcher().dispatch_job(job.clone()).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { recorded: false, .. }));
        assert!(h.jobs.saves().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
        assert!(!h.lock.is_held(job.id));
    }

    #[tokio::test]
    async fn test_recheck_load_failure_leaves_job_untouched() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        h.jobs.fail_loads("connection refused");
        let options = DispatchOptions {
            guard: DispatchGuard::Recheck,
            ..DispatchOptions::default()
        };

        let outcome = h.dispatcher(options).dispatch_job(job.clone()).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { recorded: false, .. }));
        assert!(h.jobs.saves().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_app_lookup_failure_is_not_recorded() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.apps.fail("pool timed out");
        let job = h.submitted_job(&["alice"]);

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        match outcome {
            DispatchOutcome::Failed { error, recorded } => {
                assert!(!recorded);
                assert!(error.contains("pool timed out"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.jobs.saves().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_binding_lookup_failure_marks_recipient_error() {
        let h = Harness::new();
        h.bindings.fail("binding table unavailable");
        let job = h.submitted_job(&["alice"]);

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                status: JobStatus::New,
                succeeded: 0,
                failed: 1,
                skipped: 0,
            }
        );
        let alice = &h.jobs.get(job.id).unwrap().recipients[0];
        assert!(alice.sent);
        assert_eq!(alice.status, RecipientStatus::Error);
        assert!(alice.info.as_deref().unwrap().contains("binding table unavailable"));
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_lock_failure_reports_unavailable() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        h.lock.fail("redis down");
        let job = h.submitted_job(&["alice"]);

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(outcome, DispatchOutcome::LockUnavailable);
        assert!(h.jobs.saves().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_failed_save_is_only_logged() {
        let h = Harness::new();
        h.bindings.bind(APP, "alice", "openid-alice");
        let job = h.submitted_job(&["alice"]);
        h.jobs.fail_saves("disk full");

        let outcome = h.default_dispatcher().dispatch(job.id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                status: JobStatus::Finished,
                succeeded: 1,
                failed: 0,
                skipped: 0,
            }
        );
        assert_eq!(h.messenger.sent().len(), 1);
        assert!(h.jobs.saves().is_empty());
        assert_eq!(h.jobs.get(job.id).unwrap(), job);
        assert!(!h.lock.is_held(job.id));
    }

    #[test]
    fn test_fresh_pass_with_no_recipients_is_finished() {
        assert_eq!(
            aggregate_status(FinishPolicy::FreshPass, JobStatus::New, &[], 0),
            JobStatus::Finished
        );
    }

    #[test]
    fn test_all_terminal_keeps_status_without_any_success() {
        let mut r = Recipient::new("alice");
        r.record_attempt(RecipientStatus::Error, "boom");
        assert_eq!(
            aggregate_status(FinishPolicy::AllTerminal, JobStatus::New, &[r], 0),
            JobStatus::New
        );
    }
}
