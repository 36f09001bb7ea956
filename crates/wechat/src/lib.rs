//! Template message delivery through the WeChat Official Account API.
//!
//! - [`WechatClient`]: access-token acquisition with per-app caching, template send
//! - [`oauth::authorize_url`]: wraps a page URL in the OAuth authorize redirect

pub mod client;
pub mod error;
pub mod oauth;

use async_trait::async_trait;
use relay_common::types::{SendResponse, TemplateMessage, WechatApp};

pub use client::WechatClient;
pub use error::WechatError;

/// Remote template-send operation.
///
/// A returned `SendResponse` may still carry a non-zero `errcode`; an
/// `Err` means the call itself failed.
#[async_trait]
pub trait TemplateMessenger: Send + Sync {
    async fn send_template(
        &self,
        app: &WechatApp,
        message: &TemplateMessage,
    ) -> Result<SendResponse, WechatError>;
}
