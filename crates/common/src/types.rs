use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate delivery status of a notification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Partial,
    Finished,
    Error,
}

impl JobStatus {
    /// Jobs in a terminal state are skipped entirely by the dispatcher.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Finished)
    }
}

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    New,
    Finished,
    Error,
}

/// Submission state of a job record, stored as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum DocStatus {
    Draft = 0,
    Submitted = 1,
    Cancelled = 2,
}

/// Source document types that can trigger a template notification.
///
/// `IotDeviceError` is the historical name of `IotDeviceEvent` and still
/// appears on older records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum DocumentType {
    #[serde(rename = "IOT Device Event")]
    #[sqlx(rename = "IOT Device Event")]
    IotDeviceEvent,
    #[serde(rename = "IOT Device Error")]
    #[sqlx(rename = "IOT Device Error")]
    IotDeviceError,
    #[serde(rename = "Tickets Ticket")]
    #[sqlx(rename = "Tickets Ticket")]
    TicketsTicket,
    #[serde(rename = "Tickets Ticket Bundle")]
    #[sqlx(rename = "Tickets Ticket Bundle")]
    TicketsTicketBundle,
    #[serde(rename = "ToDo")]
    #[sqlx(rename = "ToDo")]
    ToDo,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::IotDeviceEvent,
        DocumentType::IotDeviceError,
        DocumentType::TicketsTicket,
        DocumentType::TicketsTicketBundle,
        DocumentType::ToDo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::IotDeviceEvent => "IOT Device Event",
            DocumentType::IotDeviceError => "IOT Device Error",
            DocumentType::TicketsTicket => "Tickets Ticket",
            DocumentType::TicketsTicketBundle => "Tickets Ticket Bundle",
            DocumentType::ToDo => "ToDo",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown document type '{}'", s))
    }
}

/// Template slots configured per application. Document types sharing a
/// template map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKey {
    DeviceAlarm,
    TicketsTicket,
}

impl std::fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKey::DeviceAlarm => write!(f, "device_alarm_template"),
            TemplateKey::TicketsTicket => write!(f, "tickets_ticket_template"),
        }
    }
}

/// One recipient row of a notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_ref: String,
    pub sent: bool,
    pub status: RecipientStatus,
    pub info: Option<String>,
}

impl Recipient {
    pub fn new(user_ref: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            sent: false,
            status: RecipientStatus::New,
            info: None,
        }
    }

    /// Record the outcome of a delivery attempt.
    pub fn record_attempt(&mut self, status: RecipientStatus, info: impl Into<String>) {
        self.sent = true;
        self.status = status;
        self.info = Some(info.into());
    }
}

/// One outbound notification fan-out to multiple recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: Uuid,
    /// Name of the owning `WechatApp`.
    pub app: String,
    pub document_type: DocumentType,
    pub document_id: String,
    /// Insertion order is delivery order. Duplicates are kept.
    pub recipients: Vec<Recipient>,
    pub status: JobStatus,
    pub doc_status: DocStatus,
    pub error_info: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(
        app: impl Into<String>,
        document_type: DocumentType,
        document_id: impl Into<String>,
        users: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            app: app.into(),
            document_type,
            document_id: document_id.into(),
            recipients: users.into_iter().map(Recipient::new).collect(),
            status: JobStatus::New,
            doc_status: DocStatus::Draft,
            error_info: None,
            created_at: Utc::now(),
        }
    }

    /// Mark the whole job as failed.
    pub fn set_error(&mut self, info: impl Into<String>) {
        self.status = JobStatus::Error;
        self.error_info = Some(info.into());
    }
}

/// Application (official account) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WechatApp {
    pub name: String,
    pub app_id: String,
    pub secret: String,
    pub domain: String,
    pub language: Option<String>,
    pub device_alarm_template: Option<String>,
    pub tickets_ticket_template: Option<String>,
}

impl WechatApp {
    /// Template id configured for `key`, ignoring blank values.
    pub fn template_id(&self, key: TemplateKey) -> Option<&str> {
        let id = match key {
            TemplateKey::DeviceAlarm => self.device_alarm_template.as_deref(),
            TemplateKey::TicketsTicket => self.tickets_ticket_template.as_deref(),
        };
        id.filter(|s| !s.trim().is_empty())
    }
}

/// Mapping from a platform user to their openid within one application.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Binding {
    pub app: String,
    pub user_ref: String,
    pub openid: String,
}

/// Template message request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMessage {
    pub touser: String,
    pub template_id: String,
    pub url: String,
    pub data: serde_json::Value,
}

/// Response from the template send endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msgid: Option<i64>,
}

impl SendResponse {
    pub fn is_ok(&self) -> bool {
        self.errcode == 0
    }
}

impl std::fmt::Display for SendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{errcode: {}, errmsg: {:?}", self.errcode, self.errmsg)?;
        if let Some(msgid) = self.msgid {
            write!(f, ", msgid: {}", msgid)?;
        }
        write!(f, "}}")
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::New => write!(f, "new"),
            JobStatus::Partial => write!(f, "partial"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientStatus::New => write!(f, "new"),
            RecipientStatus::Finished => write!(f, "finished"),
            RecipientStatus::Error => write!(f, "error"),
        }
    }
}
