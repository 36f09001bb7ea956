//! Page context for the wechat device list.
//!
//! The device listing itself belongs to the device-management module and is
//! consumed through [`DeviceLister`].

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

const GUEST_USER: &str = "Guest";
const COMPANY_ADMIN_ROLE: &str = "Company Admin";
const LOGIN_PATH: &str = "/login";

/// A device row as returned by the device-management module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub sn: String,
    pub name: String,
    pub status: String,
}

/// Consumed device listing, filtered by a free-text category (`all`, `online`, ...).
#[async_trait]
pub trait DeviceLister: Send + Sync {
    async fn list_devices(&self, user: &str, filter: &str) -> anyhow::Result<Option<Vec<DeviceSummary>>>;
}

/// The requesting session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
    pub roles: Vec<String>,
    pub language: Option<String>,
    pub csrf_token: String,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Redirect to {0}")]
    Redirect(&'static str),

    #[error("Device listing failed: {0}")]
    Listing(String),
}

/// Rendering context of the device list page.
#[derive(Debug, Clone, Serialize)]
pub struct DevListContext {
    pub no_cache: bool,
    pub show_sidebar: bool,
    pub filter: String,
    pub language: Option<String>,
    pub csrf_token: String,
    pub is_company_admin: bool,
    pub user_devices: Vec<DeviceSummary>,
    /// One tenth of the device count, rounded up.
    pub dev_lens: usize,
    pub wechat_app: Option<String>,
    pub title: String,
}

impl DevListContext {
    /// Build the page context for `session`.
    ///
    /// `bound_app` is the app the session's wechat binding resolved to;
    /// `app_hint` is the `app` request parameter used when there is none.
    pub async fn build(
        session: &Session,
        filter: Option<&str>,
        bound_app: Option<String>,
        app_hint: Option<String>,
        lister: &dyn DeviceLister,
    ) -> Result<Self, PageError> {
        if session.user == GUEST_USER {
            return Err(PageError::Redirect(LOGIN_PATH));
        }

        let filter = filter.filter(|f| !f.is_empty()).unwrap_or("all").to_string();

        let user_devices = lister
            .list_devices(&session.user, &filter)
            .await
            .map_err(|e| {
                tracing::error!(user = %session.user, error = %e, "Device listing failed");
                PageError::Listing(e.to_string())
            })?
            .unwrap_or_default();

        Ok(Self {
            no_cache: true,
            show_sidebar: true,
            language: session.language.clone(),
            csrf_token: session.csrf_token.clone(),
            is_company_admin: session.roles.iter().any(|r| r == COMPANY_ADMIN_ROLE),
            dev_lens: user_devices.len().div_ceil(10),
            user_devices,
            filter,
            wechat_app: bound_app.or(app_hint),
            title: "Wechat Devices".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLister(Option<Vec<DeviceSummary>>);

    #[async_trait]
    impl DeviceLister for FixedLister {
        async fn list_devices(&self, _user: &str, filter: &str) -> anyhow::Result<Option<Vec<DeviceSummary>>> {
            assert!(!filter.is_empty());
            Ok(self.0.clone())
        }
    }

    fn session(user: &str, roles: &[&str]) -> Session {
        Session {
            user: user.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            language: Some("zh-cn".to_string()),
            csrf_token: "token".to_string(),
        }
    }

    fn devices(n: usize) -> Vec<DeviceSummary> {
        (0..n)
            .map(|i| DeviceSummary {
                sn: format!("SN{:04}", i),
                name: format!("Gateway {}", i),
                status: "ONLINE".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_guest_is_redirected_to_login() {
        let lister = FixedLister(Some(devices(3)));
        let result = DevListContext::build(&session("Guest", &[]), None, None, None, &lister).await;
        assert!(matches!(result, Err(PageError::Redirect("/login"))));
    }

    #[tokio::test]
    async fn test_context_defaults() {
        let lister = FixedLister(None);
        let ctx = DevListContext::build(
            &session("alice@example.com", &["Customer"]),
            Some(""),
            None,
            Some("demo".to_string()),
            &lister,
        )
        .await
        .unwrap();

        assert_eq!(ctx.filter, "all");
        assert!(ctx.user_devices.is_empty());
        assert_eq!(ctx.dev_lens, 0);
        assert!(!ctx.is_company_admin);
        assert_eq!(ctx.wechat_app.as_deref(), Some("demo"));
        assert_eq!(ctx.title, "Wechat Devices");
    }

    #[tokio::test]
    async fn test_dev_lens_rounds_up_and_bound_app_wins() {
        let lister = FixedLister(Some(devices(11)));
        let ctx = DevListContext::build(
            &session("admin@example.com", &["Company Admin"]),
            Some("online"),
            Some("bound".to_string()),
            Some("hint".to_string()),
            &lister,
        )
        .await
        .unwrap();

        assert_eq!(ctx.filter, "online");
        assert_eq!(ctx.user_devices.len(), 11);
        assert_eq!(ctx.dev_lens, 2);
        assert!(ctx.is_company_admin);
        assert_eq!(ctx.wechat_app.as_deref(), Some("bound"));
    }
}
