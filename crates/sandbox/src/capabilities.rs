//! Capability surface exposed to automation scripts.
//!
//! A [`CapabilitySurface`] is built fresh for every execution and is never
//! shared. Inside the isolate the JavaScript half of the surface (see
//! `prelude.js`) queues host requests. The engine drains them into
//! [`HostCalls`], which runs each outbound HTTP call or secret lookup as a
//! task on the host runtime. The isolate keeps firing timers while those
//! tasks are in flight, and a request aborted from the script aborts its
//! task.
//!
//! | Capability                         | Profile flag |
//! |------------------------------------|--------------|
//! | `log`, `console.*`                 | `console`    |
//! | `fetch`, `Headers`, `Response`     | `network`    |
//! | `URL`, `URLSearchParams`           | `url`        |
//! | `AbortController`, `AbortSignal`   | `abort`      |
//! | `setTimeout`, `clearTimeout`       | `timers`     |
//! | `getSecret`                        | `secrets`    |

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use boa_engine::{Context, JsNativeError, JsResult, JsString, JsValue, NativeFunction};
use evidence_store::SecretResolver;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use url::{quirks, Url};

use crate::engine::ExecutionLimits;

/// Largest response body handed back to a script (5 MiB).
pub const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

/// Which capabilities a script may use. Omitted capabilities are simply not
/// defined in the isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProfile {
    pub console: bool,
    pub network: bool,
    pub url: bool,
    pub abort: bool,
    pub timers: bool,
    pub secrets: bool,
}

impl Default for CapabilityProfile {
    fn default() -> Self {
        Self {
            console: true,
            network: true,
            url: true,
            abort: true,
            timers: true,
            secrets: true,
        }
    }
}

impl CapabilityProfile {
    /// Pure computation only: no I/O, no timers, no output.
    pub fn none() -> Self {
        Self {
            console: false,
            network: false,
            url: false,
            abort: false,
            timers: false,
            secrets: false,
        }
    }
}

/// The host side of one execution's capabilities.
#[derive(Clone)]
pub struct CapabilitySurface {
    profile: CapabilityProfile,
    secrets: Option<SecretResolver>,
    http: reqwest::Client,
}

impl CapabilitySurface {
    pub fn build(
        profile: CapabilityProfile,
        secrets: Option<SecretResolver>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            profile,
            secrets,
            http,
        }
    }

    pub fn profile(&self) -> CapabilityProfile {
        self.profile
    }

    /// Configuration document handed to the prelude.
    pub(crate) fn prelude_config(&self, limits: &ExecutionLimits) -> String {
        json!({
            "console": self.profile.console,
            "network": self.profile.network,
            "url": self.profile.url,
            "abort": self.profile.abort,
            "timers": self.profile.timers,
            "secrets": self.profile.secrets,
            "maxLogLines": limits.max_log_lines,
            "maxLogLineChars": limits.max_log_line_chars,
        })
        .to_string()
    }

    async fn handle(&self, request: HostRequest, budget: Duration) -> HostReply {
        match request {
            HostRequest::Fetch(fetch) => {
                let id = fetch.id;
                if !self.profile.network {
                    return HostReply::error(id, "TypeError", "fetch is not available");
                }
                match tokio::time::timeout(budget, perform_fetch(&self.http, fetch, budget)).await
                {
                    Ok(reply) => reply,
                    Err(_) => HostReply::error(
                        id,
                        "TimeoutError",
                        "fetch exceeded the execution time budget",
                    ),
                }
            }
            HostRequest::Secret(secret) => {
                if !self.profile.secrets {
                    return HostReply::error(secret.id, "Error", "getSecret is not available");
                }
                let Some(resolver) = &self.secrets else {
                    return HostReply::ok(secret.id, Value::Null);
                };
                match resolver.resolve(&secret.name).await {
                    Ok(Some(value)) => HostReply::ok(secret.id, Value::String(value.expose().to_string())),
                    Ok(None) => HostReply::ok(secret.id, Value::Null),
                    Err(e) => {
                        tracing::warn!(
                            organization_id = %resolver.organization_id(),
                            error = %e,
                            "Secret lookup failed"
                        );
                        HostReply::error(secret.id, "Error", "secret store unavailable")
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight host calls
// ---------------------------------------------------------------------------

/// Host requests of one execution that are running on the host runtime.
///
/// Lives on the isolate thread. Replies arrive over a channel so the event
/// loop can wait for them and for its next timer at the same time. Dropping
/// the set aborts every call still in flight.
pub(crate) struct HostCalls {
    runtime: Handle,
    surface: CapabilitySurface,
    sender: mpsc::Sender<HostReply>,
    replies: mpsc::Receiver<HostReply>,
    in_flight: HashMap<u64, JoinHandle<()>>,
}

impl HostCalls {
    pub(crate) fn new(runtime: Handle, surface: CapabilitySurface) -> Self {
        let (sender, replies) = mpsc::channel();
        Self {
            runtime,
            surface,
            sender,
            replies,
            in_flight: HashMap::new(),
        }
    }

    /// Start `request` with at most `budget` to complete.
    pub(crate) fn start(&mut self, request: HostRequest, budget: Duration) {
        let id = request.id();
        let surface = self.surface.clone();
        let sender = self.sender.clone();
        let task = self.runtime.spawn(async move {
            let reply = surface.handle(request, budget).await;
            let _ = sender.send(reply);
        });
        self.in_flight.insert(id, task);
    }

    /// Abort the call for `id`, dropping its HTTP request. Unknown ids are
    /// ignored.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(task) = self.in_flight.remove(&id) {
            task.abort();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Block for up to `timeout` until a reply arrives, then collect every
    /// reply that is ready. Sleeps for `timeout` when nothing is in flight.
    pub(crate) fn wait(&mut self, timeout: Duration) -> Vec<HostReply> {
        if self.in_flight.is_empty() {
            if !timeout.is_zero() {
                thread::sleep(timeout);
            }
            return Vec::new();
        }

        let mut replies = Vec::new();
        if let Ok(reply) = self.replies.recv_timeout(timeout) {
            replies.push(reply);
        }
        while let Ok(reply) = self.replies.try_recv() {
            replies.push(reply);
        }
        // A call aborted after it replied has no entry left; its reply is
        // dropped here.
        replies.retain(|reply| self.in_flight.remove(&reply.id).is_some());
        replies
    }
}

impl Drop for HostCalls {
    fn drop(&mut self) {
        for (_, task) in self.in_flight.drain() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Host request protocol
// ---------------------------------------------------------------------------

/// A request queued by the prelude.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum HostRequest {
    Fetch(FetchRequest),
    Secret(SecretRequest),
}

impl HostRequest {
    pub(crate) fn id(&self) -> u64 {
        match self {
            HostRequest::Fetch(fetch) => fetch.id,
            HostRequest::Secret(secret) => secret.id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct FetchRequest {
    pub id: u64,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecretRequest {
    pub id: u64,
    pub name: String,
}

/// The host's answer to one [`HostRequest`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HostReply {
    pub id: u64,
    pub ok: bool,
    pub payload: Value,
}

impl HostReply {
    fn ok(id: u64, payload: Value) -> Self {
        Self {
            id,
            ok: true,
            payload,
        }
    }

    fn error(id: u64, name: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            payload: json!({ "name": name, "message": message.into() }),
        }
    }
}

async fn perform_fetch(client: &reqwest::Client, request: FetchRequest, budget: Duration) -> HostReply {
    let id = request.id;
    let url = match Url::parse(&request.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        Ok(url) => {
            return HostReply::error(
                id,
                "TypeError",
                format!("fetch only supports http and https, not {}", url.scheme()),
            )
        }
        Err(e) => return HostReply::error(id, "TypeError", format!("Invalid URL: {e}")),
    };
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return HostReply::error(id, "TypeError", format!("Invalid method {}", request.method))
        }
    };

    let mut builder = client.request(method.clone(), url.clone()).timeout(budget);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let mut response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(%url, error = %e, "Script fetch failed");
            return HostReply::error(id, "TypeError", format!("fetch failed: {e}"));
        }
    };

    let status = response.status();
    let final_url = response.url().clone();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                    return HostReply::error(
                        id,
                        "TypeError",
                        format!("response body exceeds {MAX_RESPONSE_BYTES} bytes"),
                    );
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => return HostReply::error(id, "TypeError", format!("reading response failed: {e}")),
        }
    }

    tracing::debug!(%method, %url, status = status.as_u16(), bytes = body.len(), "Script fetch completed");

    HostReply::ok(
        id,
        json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "url": final_url.as_str(),
            "redirected": final_url != url,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }),
    )
}

// ---------------------------------------------------------------------------
// URL natives
// ---------------------------------------------------------------------------

/// Register the URL parsing natives the prelude captures and then removes
/// from the global object.
pub(crate) fn install_natives(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        JsString::from("__evidenceParseUrl"),
        2,
        NativeFunction::from_fn_ptr(parse_url),
    )?;
    context.register_global_callable(
        JsString::from("__evidenceSetUrlPart"),
        3,
        NativeFunction::from_fn_ptr(set_url_part),
    )?;
    Ok(())
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<Option<String>> {
    match args.get(index) {
        Some(value) if !value.is_undefined() => {
            Ok(Some(value.to_string(context)?.to_std_string_escaped()))
        }
        _ => Ok(None),
    }
}

fn invalid_url(message: &str) -> boa_engine::JsError {
    JsNativeError::typ().with_message(message).into()
}

/// `parse(input, base?)` → JSON of the URL components.
fn parse_url(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let input = string_arg(args, 0, context)?.unwrap_or_default();
    let base = string_arg(args, 1, context)?;
    let parsed = parse_with_base(&input, base.as_deref())
        .map_err(|e| invalid_url(format!("Invalid URL '{input}': {e}").as_str()))?;
    Ok(JsValue::from(JsString::from(url_parts(&parsed).to_string().as_str())))
}

/// `set(href, part, value)` → JSON of the URL components after the setter.
fn set_url_part(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let href = string_arg(args, 0, context)?.unwrap_or_default();
    let part = string_arg(args, 1, context)?.unwrap_or_default();
    let value = string_arg(args, 2, context)?.unwrap_or_default();
    let mut url = Url::parse(&href).map_err(|e| invalid_url(format!("Invalid URL: {e}").as_str()))?;
    apply_part(&mut url, &part, &value);
    Ok(JsValue::from(JsString::from(url_parts(&url).to_string().as_str())))
}

pub(crate) fn parse_with_base(input: &str, base: Option<&str>) -> Result<Url, url::ParseError> {
    match base {
        Some(base) => Url::parse(base)?.join(input),
        None => Url::parse(input),
    }
}

/// Apply a WHATWG URL setter. Invalid values leave the URL unchanged.
pub(crate) fn apply_part(url: &mut Url, part: &str, value: &str) {
    let _ = match part {
        "protocol" => quirks::set_protocol(url, value),
        "username" => quirks::set_username(url, value),
        "password" => quirks::set_password(url, value),
        "host" => quirks::set_host(url, value),
        "hostname" => quirks::set_hostname(url, value),
        "port" => quirks::set_port(url, value),
        "pathname" => {
            quirks::set_pathname(url, value);
            Ok(())
        }
        "search" => {
            quirks::set_search(url, value);
            Ok(())
        }
        "hash" => {
            quirks::set_hash(url, value);
            Ok(())
        }
        _ => Err(()),
    };
}

pub(crate) fn url_parts(url: &Url) -> Value {
    json!({
        "href": quirks::href(url),
        "origin": quirks::origin(url),
        "protocol": quirks::protocol(url),
        "username": quirks::username(url),
        "password": quirks::password(url),
        "host": quirks::host(url),
        "hostname": quirks::hostname(url),
        "port": quirks::port(url),
        "pathname": quirks::pathname(url),
        "search": quirks::search(url),
        "hash": quirks::hash(url),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_enables_everything() {
        let profile = CapabilityProfile::default();
        assert!(profile.console && profile.network && profile.url);
        assert!(profile.abort && profile.timers && profile.secrets);
        assert_eq!(
            serde_json::to_value(CapabilityProfile::none()).expect("serialize"),
            json!({
                "console": false, "network": false, "url": false,
                "abort": false, "timers": false, "secrets": false
            })
        );
    }

    #[test]
    fn url_parts_follow_whatwg_getters() {
        let url = parse_with_base("/v1/users?active=true#top", Some("https://api.example.com:8443"))
            .expect("parse");
        let parts = url_parts(&url);
        assert_eq!(parts["href"], "https://api.example.com:8443/v1/users?active=true#top");
        assert_eq!(parts["origin"], "https://api.example.com:8443");
        assert_eq!(parts["protocol"], "https:");
        assert_eq!(parts["host"], "api.example.com:8443");
        assert_eq!(parts["hostname"], "api.example.com");
        assert_eq!(parts["port"], "8443");
        assert_eq!(parts["pathname"], "/v1/users");
        assert_eq!(parts["search"], "?active=true");
        assert_eq!(parts["hash"], "#top");
    }

    #[test]
    fn setters_update_components() {
        let mut url = Url::parse("https://example.com/a").expect("parse");
        apply_part(&mut url, "pathname", "/b/c");
        apply_part(&mut url, "search", "?q=1");
        apply_part(&mut url, "hash", "frag");
        assert_eq!(url.as_str(), "https://example.com/b/c?q=1#frag");

        apply_part(&mut url, "port", "not-a-port");
        assert_eq!(url.port(), None);
        apply_part(&mut url, "unknown", "x");
        assert_eq!(url.as_str(), "https://example.com/b/c?q=1#frag");
    }

    #[test]
    fn relative_input_without_base_fails() {
        assert!(parse_with_base("/relative", None).is_err());
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_schemes() {
        let client = reqwest::Client::new();
        let reply = perform_fetch(
            &client,
            FetchRequest {
                id: 7,
                url: "file:///etc/passwd".into(),
                method: "GET".into(),
                headers: vec![],
                body: None,
            },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(reply.id, 7);
        assert!(!reply.ok);
        assert_eq!(reply.payload["name"], "TypeError");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn canceled_calls_never_reply() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/slow", listener.local_addr().expect("addr"));
        let surface = CapabilitySurface::build(CapabilityProfile::default(), None, reqwest::Client::new());
        let mut calls = HostCalls::new(Handle::current(), surface);

        calls.start(
            HostRequest::Fetch(FetchRequest {
                id: 1,
                url,
                method: "GET".into(),
                headers: vec![],
                body: None,
            }),
            Duration::from_secs(5),
        );
        calls.start(
            HostRequest::Secret(SecretRequest {
                id: 2,
                name: "TOKEN".into(),
            }),
            Duration::from_secs(5),
        );
        assert_eq!(calls.in_flight(), 2);

        calls.cancel(1);
        assert_eq!(calls.in_flight(), 1);

        let replies = tokio::task::block_in_place(|| calls.wait(Duration::from_secs(2)));
        assert_eq!(replies, vec![HostReply::ok(2, Value::Null)]);
        assert_eq!(calls.in_flight(), 0);
    }

    #[test]
    fn host_requests_deserialize_by_kind() {
        let requests: Vec<HostRequest> = serde_json::from_value(json!([
            { "kind": "fetch", "id": 1, "url": "https://x.test", "method": "GET",
              "headers": [["accept", "application/json"]], "body": null },
            { "kind": "secret", "id": 2, "name": "TOKEN" }
        ]))
        .expect("deserialize");
        assert!(matches!(&requests[0], HostRequest::Fetch(f) if f.headers.len() == 1));
        assert!(matches!(&requests[1], HostRequest::Secret(s) if s.name == "TOKEN"));
    }
}
