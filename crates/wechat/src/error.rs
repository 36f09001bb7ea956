use thiserror::Error;

#[derive(Debug, Error)]
pub enum WechatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Access token request failed: errcode {errcode}, errmsg {errmsg}")]
    AccessToken { errcode: i64, errmsg: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}
