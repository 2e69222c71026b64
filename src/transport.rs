// Transport layer: a small blocking HTTP abstraction plus the JSON API
// client built on top of it. Everything that talks to the network (the
// REST API, the sync gateway and the object store) goes through the
// `HttpTransport` trait so the flow can be driven by a scripted transport
// in tests.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use reqwest::Method;

/// Prefix of the REST API on the cloud host.
pub const API_PREFIX: &str = "api/1";
/// Prefix of the document sync gateway on the cloud host.
pub const GATEWAY_PREFIX: &str = "neocloud";

/// A fully described HTTP request. Headers are owned by the request and
/// built fresh for every call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Request body parsed as JSON, if any.
    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// Raw HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Executes HTTP requests. Implementations only fail on connection-level
/// problems; HTTP error statuses are returned as regular responses.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production transport backed by a blocking reqwest client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let res = builder.send()?;
        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = res.bytes()?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// JSON client for the cloud host. Holds the transport, the host name and
/// an optional bearer token for authenticated calls.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    cloud: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>, cloud: impl Into<String>) -> Self {
        Self {
            transport,
            cloud: cloud.into(),
            token: None,
        }
    }

    /// Store a bearer token for subsequent authenticated requests.
    pub fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    /// Returns whether a token is present in the client.
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    /// Authorization header when a token is set.
    fn auth_headers(&self) -> Vec<(String, String)> {
        match &self.token {
            Some(t) => vec![("Authorization".to_string(), format!("Bearer {}", t))],
            None => Vec::new(),
        }
    }

    fn url(&self, prefix: &str, path: &str) -> String {
        format!("https://{}/{}/{}", self.cloud, prefix, path.trim_start_matches('/'))
    }

    /// Call a REST API path and return the parsed JSON reply.
    ///
    /// `body` is the explicit "no body" sentinel: `None` keeps `method`,
    /// `Some` forces a POST with a JSON content type, even for an empty
    /// object.
    pub fn call(
        &self,
        path: &str,
        method: Method,
        headers: &[(&str, &str)],
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let mut method = method;
        let mut req_headers = self.auth_headers();
        req_headers.extend(headers.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut payload = None;
        if let Some(body) = body {
            method = Method::POST;
            req_headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
            req_headers.push((
                "Content-Type".to_string(),
                "application/json; charset=utf-8".to_string(),
            ));
            payload = Some(serde_json::to_vec(body)?);
        }

        let request = HttpRequest {
            method,
            url: self.url(API_PREFIX, path),
            headers: req_headers,
            query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            body: payload,
        };
        self.send_json(path, request)
    }

    /// GET an API path without a body.
    pub fn get(&self, path: &str) -> Result<Value> {
        self.call(path, Method::GET, &[], None, &[])
    }

    /// GET an API path with query parameters.
    pub fn get_with_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.call(path, Method::GET, &[], None, query)
    }

    /// POST a JSON body to an API path.
    pub fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.call(path, Method::POST, &[], Some(body), &[])
    }

    /// POST a JSON body to the sync gateway. The gateway wants the bearer
    /// token and the sync session cookie on every write.
    pub fn gateway_post(&self, path: &str, body: &Value, session_id: &str) -> Result<Value> {
        let mut headers = self.auth_headers();
        headers.push(("Accept".to_string(), "application/json".to_string()));
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        headers.push((
            "Cookie".to_string(),
            format!("SyncGatewaySession={}", session_id),
        ));

        let request = HttpRequest {
            method: Method::POST,
            url: self.url(GATEWAY_PREFIX, path),
            headers,
            query: Vec::new(),
            body: Some(serde_json::to_vec(body)?),
        };
        self.send_json(path, request)
    }

    fn send_json(&self, path: &str, request: HttpRequest) -> Result<Value> {
        let method = request.method.clone();
        let res = self.transport.execute(request)?;
        log_response(path, &res);

        serde_json::from_slice(&res.body).map_err(|e| {
            Error::protocol(format!(
                "{} {} returned a non-JSON body (HTTP {}): {}",
                method, path, res.status, e
            ))
        })
    }
}

/// Log a response body. Never fails: bodies that are not JSON are logged raw.
fn log_response(path: &str, res: &HttpResponse) {
    match serde_json::from_slice::<Value>(&res.body) {
        Ok(json) => {
            let pretty = serde_json::to_string_pretty(&json).unwrap_or_default();
            debug!(path, status = res.status, "response:\n{}", pretty);
        }
        Err(e) => {
            debug!(path, status = res.status, error = %e, "response is not JSON: {}", res.text());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{json_response, MockTransport};
    use serde_json::json;

    fn client(mock: &Arc<MockTransport>) -> ApiClient {
        let mut api = ApiClient::new(mock.clone(), "eur.boox.com");
        api.set_token("T");
        api
    }

    #[test]
    fn get_attaches_bearer_and_keeps_method() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "/api/1/users/me", json_response(json!({"data": {"uid": "U"}})));

        let reply = client(&mock).get("users/me").unwrap();
        assert_eq!(reply["data"]["uid"], "U");

        let reqs = mock.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, Method::GET);
        assert_eq!(reqs[0].url, "https://eur.boox.com/api/1/users/me");
        assert_eq!(reqs[0].header_value("authorization"), Some("Bearer T"));
        assert!(reqs[0].body.is_none());
        assert!(reqs[0].header_value("content-type").is_none());
    }

    #[test]
    fn body_forces_post_even_when_empty() {
        let mock = MockTransport::new();
        mock.on(Method::POST, "/api/1/users/sendMobileCode", json_response(json!({})));

        client(&mock)
            .call("users/sendMobileCode", Method::GET, &[], Some(&json!({})), &[])
            .unwrap();

        let req = &mock.requests()[0];
        assert_eq!(req.method, Method::POST);
        assert_eq!(
            req.header_value("Content-Type"),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn no_token_no_authorization_header() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "users/me", json_response(json!({})));

        let api = ApiClient::new(mock.clone(), "eur.boox.com");
        api.get("users/me").unwrap();
        assert!(mock.requests()[0].header_value("Authorization").is_none());
    }

    #[test]
    fn query_parameters_are_forwarded() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "push/message", json_response(json!({"list": []})));

        client(&mock)
            .get_with_query("push/message", &[("where", "{\"limit\": 1}".to_string())])
            .unwrap();
        assert_eq!(
            mock.requests()[0].query_value("where"),
            Some("{\"limit\": 1}")
        );
    }

    #[test]
    fn gateway_post_sets_session_cookie() {
        let mock = MockTransport::new();
        mock.on(Method::POST, "/neocloud/_revs_diff", json_response(json!({})));

        client(&mock)
            .gateway_post("_revs_diff", &json!({"doc": ["2-abc"]}), "S1")
            .unwrap();

        let req = &mock.requests()[0];
        assert_eq!(req.url, "https://eur.boox.com/neocloud/_revs_diff");
        assert_eq!(req.header_value("Cookie"), Some("SyncGatewaySession=S1"));
        assert_eq!(req.header_value("Authorization"), Some("Bearer T"));
        assert_eq!(req.json_body().unwrap(), json!({"doc": ["2-abc"]}));
    }

    #[test]
    fn non_json_reply_is_protocol_error() {
        let mock = MockTransport::new();
        mock.on(
            Method::GET,
            "users/me",
            HttpResponse {
                status: 502,
                headers: Vec::new(),
                body: b"<html>bad gateway</html>".to_vec(),
            },
        );

        let err = client(&mock).get("users/me").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
