// Session bootstrap: resolve a bearer token, then discover the user id,
// the object-storage bucket and the sync gateway session. Construction is
// an explicit factory, `Session::create`; nothing touches the network
// implicitly.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::oss::TemporaryCredential;
use crate::transport::ApiClient;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Everything the upload-and-register flow needs to know about the
/// authenticated account. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub cloud: String,
    pub bearer_token: String,
    pub user_id: String,
    pub sync_session_id: String,
    pub bucket_name: String,
    pub object_endpoint: String,
    pub device_mac: Option<String>,
}

impl Session {
    /// Authenticate and discover the session. The token comes from the
    /// config; without one, `email` from the config and `code` are
    /// exchanged for a token first. The resolved token is left on `api`.
    pub fn create(api: &mut ApiClient, config: &Config, code: Option<&str>) -> Result<Session> {
        let token = match (config.token(), config.email.as_deref(), code) {
            (Some(token), _, _) => token.to_string(),
            (None, Some(email), Some(code)) => login(api, email, code)?,
            (None, None, Some(_)) => {
                return Err(Error::Authentication(
                    "a verification code was given but no email is configured".into(),
                ))
            }
            (None, _, None) => {
                return Err(Error::Authentication(
                    "no token configured; log in with your email and a verification code".into(),
                ))
            }
        };
        api.set_token(&token);

        let me = api.get("users/me")?;
        let user_id = string_at(&me, "/data/uid").ok_or_else(|| {
            Error::Authentication("users/me did not return a user id; is the token valid?".into())
        })?;
        debug!(user_id = %user_id, "authenticated");

        // both calls only matter for their server-side effects
        api.get("users/getDevice")?;
        api.get_with_query("im/getSig", &[("user", user_id.clone())])?;

        let buckets = api.get("config/buckets")?;
        let bucket_name = string_at(&buckets, "/data/onyx-cloud/bucket")
            .ok_or_else(|| Error::Configuration("config/buckets lacks onyx-cloud.bucket".into()))?;
        let object_endpoint = string_at(&buckets, "/data/onyx-cloud/aliEndpoint").ok_or_else(|| {
            Error::Configuration("config/buckets lacks onyx-cloud.aliEndpoint".into())
        })?;

        let sync = api.get("users/syncToken")?;
        let sync_session_id = string_at(&sync, "/data/session_id")
            .ok_or_else(|| Error::Configuration("users/syncToken lacks session_id".into()))?;

        info!(user_id = %user_id, bucket = %bucket_name, "session established");
        Ok(Session {
            cloud: api.cloud().to_string(),
            bearer_token: token,
            user_id,
            sync_session_id,
            bucket_name,
            object_endpoint,
            device_mac: config.device_mac.clone().filter(|m| !m.trim().is_empty()),
        })
    }

    /// Prefix under which this user's pushed objects live.
    pub fn push_prefix(&self) -> String {
        format!("{}/push/", self.user_id)
    }
}

/// Exchange an email and a one-time code for a bearer token.
pub fn login(api: &ApiClient, email: &str, code: &str) -> Result<String> {
    let reply = api.post(
        "users/signupByPhoneOrEmail",
        &json!({ "mobi": email, "code": code }),
    )?;
    string_at(&reply, "/data/token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Authentication("login did not return a token".into()))
}

/// Ask the service to mail a one-time verification code.
pub fn request_verification_code(api: &ApiClient, email: &str) -> Result<()> {
    api.post("users/sendMobileCode", &json!({ "mobi": email }))?;
    Ok(())
}

/// Fetch a fresh temporary object-storage credential.
pub fn fetch_credential(api: &ApiClient) -> Result<TemporaryCredential> {
    let reply = api.get("config/stss")?;
    let data = reply
        .get("data")
        .cloned()
        .ok_or_else(|| Error::Configuration("config/stss returned no data".into()))?;
    serde_json::from_value(data)
        .map_err(|e| Error::Configuration(format!("config/stss: {}", e)))
}

/// String (or number, rendered) at a JSON pointer.
pub(crate) fn string_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
