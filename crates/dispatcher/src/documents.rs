//! Source documents and their template-message extension points.
//!
//! Every document type that can trigger a notification knows how to render
//! its own template data and the page the message should open. The locale is
//! passed in by the dispatcher.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use relay_common::types::DocumentType;

const COLOR_DEFAULT: &str = "#173177";
const COLOR_ALARM: &str = "#FF0000";

/// Extension points a source document provides to the dispatcher.
///
/// `None` means the document cannot produce a message, which fails the job.
pub trait TemplateSource {
    fn template_data(&self, locale: &str) -> Option<Value>;
    fn target_url(&self, locale: &str) -> Option<String>;
}

/// An event reported by an IoT gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEvent {
    pub name: String,
    pub device: String,
    pub title: String,
    pub event_type: String,
    /// 1 (info) to 5 (fatal)
    #[serde(default)]
    pub event_level: u8,
    pub event_time: DateTime<Utc>,
}

/// A support ticket.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub name: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub raised_by: Option<String>,
    pub created: DateTime<Utc>,
}

/// A group of tickets handled together.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketBundle {
    pub name: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub ticket_count: u32,
    pub created: DateTime<Utc>,
}

/// A task assigned to a user.
#[derive(Debug, Clone, Deserialize)]
pub struct ToDo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub reference_type: Option<String>,
    #[serde(default)]
    pub reference_name: Option<String>,
}

/// A loaded source document.
#[derive(Debug, Clone)]
pub enum SourceDocument {
    DeviceEvent(DeviceEvent),
    Ticket(Ticket),
    TicketBundle(TicketBundle),
    ToDo(ToDo),
}

impl SourceDocument {
    /// Decode a stored payload for `document_type`.
    pub fn from_payload(document_type: DocumentType, payload: Value) -> serde_json::Result<Self> {
        Ok(match document_type {
            DocumentType::IotDeviceEvent | DocumentType::IotDeviceError => {
                SourceDocument::DeviceEvent(serde_json::from_value(payload)?)
            }
            DocumentType::TicketsTicket => SourceDocument::Ticket(serde_json::from_value(payload)?),
            DocumentType::TicketsTicketBundle => {
                SourceDocument::TicketBundle(serde_json::from_value(payload)?)
            }
            DocumentType::ToDo => SourceDocument::ToDo(serde_json::from_value(payload)?),
        })
    }

    fn source(&self) -> &dyn TemplateSource {
        match self {
            SourceDocument::DeviceEvent(d) => d,
            SourceDocument::Ticket(d) => d,
            SourceDocument::TicketBundle(d) => d,
            SourceDocument::ToDo(d) => d,
        }
    }
}

impl TemplateSource for SourceDocument {
    fn template_data(&self, locale: &str) -> Option<Value> {
        self.source().template_data(locale)
    }

    fn target_url(&self, locale: &str) -> Option<String> {
        self.source().target_url(locale)
    }
}

/// Static labels used in template bodies.
struct Labels {
    device_event_first: &'static str,
    ticket_first: &'static str,
    bundle_first: &'static str,
    todo_first: &'static str,
    level: &'static str,
    tickets: &'static str,
    reference: &'static str,
    remark: &'static str,
}

static LABELS_EN: Labels = Labels {
    device_event_first: "Device alarm",
    ticket_first: "Ticket update",
    bundle_first: "Ticket bundle update",
    todo_first: "New task assigned",
    level: "Level",
    tickets: "tickets",
    reference: "Reference",
    remark: "Tap for details",
};

static LABELS_ZH: Labels = Labels {
    device_event_first: "设备告警",
    ticket_first: "工单更新",
    bundle_first: "工单组更新",
    todo_first: "新的待办事项",
    level: "级别",
    tickets: "个工单",
    reference: "关联",
    remark: "点击查看详情",
};

fn labels(locale: &str) -> &'static Labels {
    if locale.to_ascii_lowercase().starts_with("zh") {
        &LABELS_ZH
    } else {
        &LABELS_EN
    }
}

fn field(value: impl Into<String>, color: &str) -> Value {
    json!({ "value": value.into(), "color": color })
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

impl TemplateSource for DeviceEvent {
    fn template_data(&self, locale: &str) -> Option<Value> {
        let l = labels(locale);
        let title = non_empty(&self.title)?;
        let color = if self.event_level >= 3 { COLOR_ALARM } else { COLOR_DEFAULT };

        Some(json!({
            "first": field(l.device_event_first, color),
            "keyword1": field(non_empty(&self.device)?, COLOR_DEFAULT),
            "keyword2": field(format!("{} ({} {})", self.event_type, l.level, self.event_level), color),
            "keyword3": field(format_time(&self.event_time), COLOR_DEFAULT),
            "keyword4": field(title, COLOR_DEFAULT),
            "remark": field(l.remark, COLOR_DEFAULT),
        }))
    }

    fn target_url(&self, _locale: &str) -> Option<String> {
        non_empty(&self.name).map(|n| format!("/iot_device_event/{}", n))
    }
}

impl TemplateSource for Ticket {
    fn template_data(&self, locale: &str) -> Option<Value> {
        let l = labels(locale);
        let title = non_empty(&self.title)?;

        Some(json!({
            "first": field(l.ticket_first, COLOR_DEFAULT),
            "keyword1": field(&self.name, COLOR_DEFAULT),
            "keyword2": field(title, COLOR_DEFAULT),
            "keyword3": field(&self.status, COLOR_DEFAULT),
            "keyword4": field(self.raised_by.clone().unwrap_or_default(), COLOR_DEFAULT),
            "keyword5": field(format_time(&self.created), COLOR_DEFAULT),
            "remark": field(l.remark, COLOR_DEFAULT),
        }))
    }

    fn target_url(&self, _locale: &str) -> Option<String> {
        non_empty(&self.name).map(|n| format!("/tickets_ticket/{}", n))
    }
}

impl TemplateSource for TicketBundle {
    fn template_data(&self, locale: &str) -> Option<Value> {
        let l = labels(locale);
        let title = non_empty(&self.title)?;

        Some(json!({
            "first": field(l.bundle_first, COLOR_DEFAULT),
            "keyword1": field(&self.name, COLOR_DEFAULT),
            "keyword2": field(format!("{} ({} {})", title, self.ticket_count, l.tickets), COLOR_DEFAULT),
            "keyword3": field(&self.status, COLOR_DEFAULT),
            "keyword4": field(format_time(&self.created), COLOR_DEFAULT),
            "remark": field(l.remark, COLOR_DEFAULT),
        }))
    }

    fn target_url(&self, _locale: &str) -> Option<String> {
        non_empty(&self.name).map(|n| format!("/tickets_ticket_bundle/{}", n))
    }
}

impl TemplateSource for ToDo {
    fn template_data(&self, locale: &str) -> Option<Value> {
        let l = labels(locale);
        let description = non_empty(&self.description)?;
        let date = self.date.map(|d| d.to_string()).unwrap_or_default();

        let remark = match (&self.reference_type, &self.reference_name) {
            (Some(t), Some(n)) => format!("{}: {} {}", l.reference, t, n),
            _ => l.remark.to_string(),
        };

        Some(json!({
            "first": field(l.todo_first, COLOR_DEFAULT),
            "keyword1": field(description, COLOR_DEFAULT),
            "keyword2": field(self.owner.clone().unwrap_or_default(), COLOR_DEFAULT),
            "keyword3": field(date, COLOR_DEFAULT),
            "remark": field(remark, COLOR_DEFAULT),
        }))
    }

    fn target_url(&self, _locale: &str) -> Option<String> {
        non_empty(&self.name).map(|n| format!("/todo/{}", n))
    }
}
