use reqwest::Url;

use crate::error::WechatError;

const AUTHORIZE_ENDPOINT: &str = "https://open.weixin.qq.com/connect/oauth2/authorize";

/// Wrap `redirect_uri` in the OAuth authorize URL so that opening the
/// message identifies the user (`snsapi_base` scope, no consent page).
pub fn authorize_url(app_id: &str, redirect_uri: &str) -> Result<String, WechatError> {
    let mut url = Url::parse_with_params(
        AUTHORIZE_ENDPOINT,
        &[
            ("appid", app_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", "snsapi_base"),
            ("state", ""),
        ],
    )
    .map_err(|e| WechatError::InvalidUrl(e.to_string()))?;
    url.set_fragment(Some("wechat_redirect"));
    Ok(url.to_string())
}
