// Scripted transport for tests. Routes are matched by method and a URL
// fragment (optionally a query key); each route replays its queued
// responses in order and keeps repeating the last one.

use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Responder = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

struct Route {
    method: Method,
    fragment: String,
    query_key: Option<String>,
    responses: VecDeque<Responder>,
}

impl Route {
    fn matches(&self, request: &HttpRequest) -> bool {
        self.method == request.method
            && request.url.contains(&self.fragment)
            && self
                .query_key
                .as_deref()
                .map_or(true, |key| request.query_value(key).is_some())
    }
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for requests matching `method` and `fragment`.
    pub fn on(&self, method: Method, fragment: &str, response: HttpResponse) {
        self.push(method, fragment, None, fixed(response));
    }

    /// Like `on`, but the request must also carry the query key `key`.
    pub fn on_query(&self, method: Method, fragment: &str, key: &str, response: HttpResponse) {
        self.push(method, fragment, Some(key.to_string()), fixed(response));
    }

    /// Answer matching requests with a reply computed from the request.
    pub fn on_fn<F>(&self, method: Method, fragment: &str, responder: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.push(method, fragment, None, Arc::new(responder));
    }

    fn push(&self, method: Method, fragment: &str, query_key: Option<String>, response: Responder) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.fragment == fragment && r.query_key == query_key)
        {
            route.responses.push_back(response);
            return;
        }
        routes.push(Route {
            method,
            fragment: fragment.to_string(),
            query_key,
            responses: VecDeque::from([response]),
        });
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose URL contains `fragment`.
    pub fn requests_to(&self, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }
}

impl HttpTransport for MockTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let mut routes = self.routes.lock().unwrap();
        // routes with a query key are more specific, try them first
        let index = routes
            .iter()
            .position(|r| r.query_key.is_some() && r.matches(&request))
            .or_else(|| routes.iter().position(|r| r.matches(&request)))
            .ok_or_else(|| {
                Error::protocol(format!("no mock route for {} {}", request.method, request.url))
            })?;
        let route = &mut routes[index];

        let responder = if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        };
        drop(routes);
        let responder = responder.ok_or_else(|| Error::protocol("mock route has no responses"))?;
        Ok(responder(&request))
    }
}

fn fixed(response: HttpResponse) -> Responder {
    Arc::new(move |_: &HttpRequest| response.clone())
}

pub fn json_response(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        headers: vec![("Content-Type".into(), "application/json".into())],
        body: serde_json::to_vec(&body).unwrap(),
    }
}

pub fn status_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: Vec::new(),
        body: body.as_bytes().to_vec(),
    }
}

/// Object-store style XML error reply.
pub fn oss_error(status: u16, code: &str) -> HttpResponse {
    status_response(
        status,
        &format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{} happened</Message><RequestId>REQ{}</RequestId></Error>",
            code, code, status
        ),
    )
}

pub fn with_header(mut response: HttpResponse, name: &str, value: &str) -> HttpResponse {
    response.headers.push((name.to_string(), value.to_string()));
    response
}

/// Replies for every call `Session::create` makes, for user `U`.
pub fn script_bootstrap(mock: &MockTransport) {
    mock.on(Method::GET, "/api/1/users/me", json_response(json!({"data": {"uid": "U"}})));
    mock.on(Method::GET, "/api/1/users/getDevice", json_response(json!({"data": []})));
    mock.on(Method::GET, "/api/1/im/getSig", json_response(json!({"data": "sig"})));
    mock.on(
        Method::GET,
        "/api/1/config/buckets",
        json_response(json!({"data": {"onyx-cloud": {
            "bucket": "onyx-cloud-us",
            "aliEndpoint": "oss-us-west-1.aliyuncs.com"
        }}})),
    );
    mock.on(
        Method::GET,
        "/api/1/users/syncToken",
        json_response(json!({"data": {"session_id": "S"}})),
    );
}

/// A sync gateway that reports every announced revision as missing and
/// accepts every bulk write.
pub fn script_gateway(mock: &MockTransport) {
    mock.on_fn(Method::POST, "/neocloud/_revs_diff", |req| {
        let body = req.json_body().unwrap_or(Value::Null);
        let mut reply = serde_json::Map::new();
        if let Some(map) = body.as_object() {
            for (doc, revs) in map {
                reply.insert(doc.clone(), json!({ "missing": revs }));
            }
        }
        json_response(Value::Object(reply))
    });
    mock.on_fn(Method::POST, "/neocloud/_bulk_docs", |req| {
        let body = req.json_body().unwrap_or(Value::Null);
        let results: Vec<Value> = body["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .map(|d| json!({ "id": d["_id"], "rev": d["_rev"] }))
                    .collect()
            })
            .unwrap_or_default();
        json_response(Value::Array(results))
    });
}
