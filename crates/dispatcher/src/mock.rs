//! In-memory implementations of the dispatcher seams for tests.
//!
//! Available to other crates with the `test-utils` feature.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use relay_common::error::AppError;
use relay_common::types::{
    DocStatus, DocumentType, JobStatus, NotificationJob, SendResponse, TemplateMessage, WechatApp,
};
use relay_wechat::{TemplateMessenger, WechatError};

use crate::documents::SourceDocument;
use crate::lock::DispatchLock;
use crate::queue::TaskQueue;
use crate::store::{AppDirectory, BindingDirectory, DocumentStore, JobStore};

/// Scripted failure returned by a mock instead of its normal result.
type Failure = Arc<Mutex<Option<String>>>;

fn check(failure: &Failure) -> Result<(), AppError> {
    match failure.lock().unwrap().as_ref() {
        Some(msg) => Err(AppError::Internal(msg.clone())),
        None => Ok(()),
    }
}

// ===== MockJobStore =====

#[derive(Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, NotificationJob>>>,
    saves: Arc<Mutex<Vec<NotificationJob>>>,
    load_failure: Failure,
    save_failure: Failure,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job without counting it as a save.
    pub fn insert(&self, job: NotificationJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get(&self, job_id: Uuid) -> Option<NotificationJob> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    /// Every job snapshot passed to `save`, in order.
    pub fn saves(&self) -> Vec<NotificationJob> {
        self.saves.lock().unwrap().clone()
    }

    /// Make every later `load` fail with `msg`.
    pub fn fail_loads(&self, msg: &str) {
        *self.load_failure.lock().unwrap() = Some(msg.to_string());
    }

    /// Make every later `save` fail with `msg`. Failed saves are not recorded.
    pub fn fail_saves(&self, msg: &str) {
        *self.save_failure.lock().unwrap() = Some(msg.to_string());
    }

    /// Overwrite the stored status, as a concurrent writer would.
    pub fn set_status(&self, job_id: Uuid, status: JobStatus) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.status = status;
        }
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<NotificationJob>, AppError> {
        check(&self.load_failure)?;
        Ok(self.get(job_id))
    }

    async fn save(&self, job: &NotificationJob) -> Result<(), AppError> {
        check(&self.save_failure)?;
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        self.saves.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn list_dispatchable(&self, created_after: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let jobs = self.jobs.lock().unwrap();
        let mut eligible: Vec<&NotificationJob> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::New
                    && j.doc_status == DocStatus::Submitted
                    && j.created_at > created_after
            })
            .collect();
        eligible.sort_by_key(|j| j.created_at);
        Ok(eligible.into_iter().map(|j| j.id).collect())
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| j.created_at >= cutoff);
        Ok((before - jobs.len()) as u64)
    }
}

// ===== MockAppDirectory =====

#[derive(Clone, Default)]
pub struct MockAppDirectory {
    apps: Arc<Mutex<HashMap<String, WechatApp>>>,
    failure: Failure,
}

impl MockAppDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_app(&self, app: WechatApp) {
        self.apps.lock().unwrap().insert(app.name.clone(), app);
    }

    pub fn fail(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl AppDirectory for MockAppDirectory {
    async fn get_app(&self, name: &str) -> Result<Option<WechatApp>, AppError> {
        check(&self.failure)?;
        Ok(self.apps.lock().unwrap().get(name).cloned())
    }
}

// ===== MockDocumentStore =====

#[derive(Clone, Default)]
pub struct MockDocumentStore {
    documents: Arc<Mutex<HashMap<(DocumentType, String), SourceDocument>>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&self, document_type: DocumentType, document_id: &str, doc: SourceDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert((document_type, document_id.to_string()), doc);
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn get_document(
        &self,
        document_type: DocumentType,
        document_id: &str,
    ) -> Result<Option<SourceDocument>, AppError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(&(document_type, document_id.to_string()))
            .cloned())
    }
}

// ===== MockBindingDirectory =====

#[derive(Clone, Default)]
pub struct MockBindingDirectory {
    bindings: Arc<Mutex<HashMap<(String, String), String>>>,
    failure: Failure,
}

impl MockBindingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, app: &str, user_ref: &str, openid: &str) {
        self.bindings
            .lock()
            .unwrap()
            .insert((app.to_string(), user_ref.to_string()), openid.to_string());
    }

    pub fn fail(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl BindingDirectory for MockBindingDirectory {
    async fn openid(&self, app: &str, user_ref: &str) -> Result<Option<String>, AppError> {
        check(&self.failure)?;
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .get(&(app.to_string(), user_ref.to_string()))
            .cloned())
    }
}

// ===== MockMessenger =====

/// Scripted outcome of a template send for one openid.
#[derive(Debug, Clone)]
pub enum MockReply {
    ErrCode(i64),
    Fail(String),
}

/// Replies with `errcode: 0` unless a reply is scripted for the openid.
#[derive(Clone, Default)]
pub struct MockMessenger {
    replies: Arc<Mutex<HashMap<String, MockReply>>>,
    sent: Arc<Mutex<Vec<TemplateMessage>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, openid: &str, reply: MockReply) {
        self.replies.lock().unwrap().insert(openid.to_string(), reply);
    }

    /// Hold every send for `delay` before replying.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every message passed to `send_template`, in order.
    pub fn sent(&self) -> Vec<TemplateMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TemplateMessenger for MockMessenger {
    async fn send_template(
        &self,
        _app: &WechatApp,
        message: &TemplateMessage,
    ) -> Result<SendResponse, WechatError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(message.clone());

        let reply = self.replies.lock().unwrap().get(&message.touser).cloned();
        match reply {
            None => Ok(SendResponse {
                errcode: 0,
                errmsg: "ok".to_string(),
                msgid: Some(1),
            }),
            Some(MockReply::ErrCode(errcode)) => Ok(SendResponse {
                errcode,
                errmsg: "mock failure".to_string(),
                msgid: None,
            }),
            Some(MockReply::Fail(msg)) => Err(WechatError::AccessToken {
                errcode: -1,
                errmsg: msg,
            }),
        }
    }
}

// ===== MockTaskQueue =====

/// How long `pop` waits on an empty queue before returning `None`.
const EMPTY_POP_WAIT: Duration = Duration::from_millis(10);

#[derive(Clone, Default)]
pub struct MockTaskQueue {
    tasks: Arc<Mutex<Vec<Uuid>>>,
}

impl MockTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Uuid> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for MockTaskQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), AppError> {
        self.tasks.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn pop(&self, _timeout_secs: u64) -> Result<Option<Uuid>, AppError> {
        let next = {
            let mut tasks = self.tasks.lock().unwrap();
            (!tasks.is_empty()).then(|| tasks.remove(0))
        };
        if next.is_none() {
            tokio::time::sleep(EMPTY_POP_WAIT).await;
        }
        Ok(next)
    }
}

// ===== MockDispatchLock =====

#[derive(Clone, Default)]
pub struct MockDispatchLock {
    held: Arc<Mutex<HashSet<Uuid>>>,
    failure: Failure,
}

impl MockDispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the claim as another dispatch would.
    pub fn hold(&self, job_id: Uuid) {
        self.held.lock().unwrap().insert(job_id);
    }

    pub fn is_held(&self, job_id: Uuid) -> bool {
        self.held.lock().unwrap().contains(&job_id)
    }

    pub fn fail(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl DispatchLock for MockDispatchLock {
    async fn try_claim(&self, job_id: Uuid, _ttl_secs: u64) -> Result<bool, AppError> {
        check(&self.failure)?;
        Ok(self.held.lock().unwrap().insert(job_id))
    }

    async fn release(&self, job_id: Uuid) -> Result<(), AppError> {
        self.held.lock().unwrap().remove(&job_id);
        Ok(())
    }
}
