use reqwest::Url;

use relay_common::error::DispatchError;

/// Build the redirect URL embedded in a template message.
///
/// The platform page `target_url` and the app name travel as query
/// parameters of the host's `/wechat_redirect` endpoint.
pub fn redirect_url(domain: &str, target_url: &str, app: &str) -> Result<String, DispatchError> {
    let domain = domain.trim().trim_end_matches('/');
    if domain.is_empty() {
        return Err(DispatchError::Configuration(format!(
            "Wechat app {} has no domain configured",
            app
        )));
    }

    let mut url = Url::parse(&format!("http://{}/wechat_redirect", domain)).map_err(|e| {
        DispatchError::Configuration(format!("Invalid domain '{}' for app {}: {}", domain, app, e))
    })?;
    url.query_pairs_mut()
        .append_pair("wc_rurl", target_url)
        .append_pair("app", app);

    Ok(url.to_string())
}
