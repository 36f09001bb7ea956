//! Document type → template slot mapping.
//!
//! Renamed document types keep pointing at the template of their successor,
//! so several entries may share a key. Every known document type must have
//! exactly one entry; [`validate_template_table`] is run at startup.

use relay_common::error::AppError;
use relay_common::types::{DocumentType, TemplateKey};

pub const TEMPLATE_TABLE: &[(DocumentType, TemplateKey)] = &[
    (DocumentType::IotDeviceEvent, TemplateKey::DeviceAlarm),
    // Historical name of IOT Device Event
    (DocumentType::IotDeviceError, TemplateKey::DeviceAlarm),
    (DocumentType::TicketsTicket, TemplateKey::TicketsTicket),
    (DocumentType::TicketsTicketBundle, TemplateKey::TicketsTicket),
    (DocumentType::ToDo, TemplateKey::TicketsTicket),
];

/// Template slot used for notifications about `document_type`.
pub fn template_key(document_type: DocumentType) -> Option<TemplateKey> {
    TEMPLATE_TABLE
        .iter()
        .find(|(t, _)| *t == document_type)
        .map(|(_, key)| *key)
}

/// Check that [`TEMPLATE_TABLE`] covers every document type exactly once.
pub fn validate_template_table() -> Result<(), AppError> {
    validate(TEMPLATE_TABLE)
}

fn validate(table: &[(DocumentType, TemplateKey)]) -> Result<(), AppError> {
    for document_type in DocumentType::ALL {
        let entries = table.iter().filter(|(t, _)| *t == document_type).count();
        match entries {
            1 => {}
            0 => {
                return Err(AppError::Config(format!(
                    "No template mapping for document type '{}'",
                    document_type
                )));
            }
            n => {
                return Err(AppError::Config(format!(
                    "Document type '{}' has {} template mappings",
                    document_type, n
                )));
            }
        }
    }
    Ok(())
}
