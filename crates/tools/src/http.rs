//! HTTP tool dispatch: request assembly, authentication, retry with
//! exponential back-off and jitter, and content-type-aware parsing.

use std::time::{Duration, Instant};

use cf_domain::config::HttpConfig;
use cf_domain::{ContentType, Error, HttpToolConfig, Result, ToolAuth};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use cf_script::{render, to_display, FunctionRegistry, Scope};

/// Path segments keep only unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Call metadata surfaced to the transaction log regardless of outcome.
#[derive(Debug, Clone)]
pub struct HttpCallInfo {
    /// `"METHOD url"` after path substitution, without query or secrets.
    pub signature: String,
    pub attempts: u32,
}

/// Shared HTTP dispatcher. Two prebuilt clients: redirects are followed
/// only for idempotent methods.
pub struct HttpDispatcher {
    redirecting: Client,
    direct: Client,
    defaults: HttpConfig,
}

impl HttpDispatcher {
    pub fn new(defaults: HttpConfig) -> Result<Self> {
        let redirecting = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        let direct = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            redirecting,
            direct,
            defaults,
        })
    }

    /// Execute an HTTP tool call. `scope` must already expose the
    /// assembled arguments as `$args`.
    pub async fn dispatch(
        &self,
        cfg: &HttpToolConfig,
        scope: &Scope<'_>,
        funcs: &FunctionRegistry,
        cancel: Option<&CancellationToken>,
    ) -> (Result<Value>, HttpCallInfo) {
        let method = cfg.method.to_ascii_uppercase();

        let url = match substitute_path_params(cfg, scope, funcs) {
            Ok(url) => url,
            Err(e) => {
                return (
                    Err(e),
                    HttpCallInfo {
                        signature: format!("{method} {}", cfg.url),
                        attempts: 0,
                    },
                )
            }
        };
        let signature = format!("{method} {url}");

        let mut info = HttpCallInfo {
            signature: signature.clone(),
            attempts: 0,
        };

        let prepared = match self.prepare(cfg, scope, funcs, &method, &url) {
            Ok(prepared) => prepared,
            Err(e) => return (Err(e), info),
        };

        let result = self.execute_with_retry(cfg, &prepared, cancel, &mut info).await;
        (result, info)
    }

    // ── request assembly ───────────────────────────────────────────

    fn prepare(
        &self,
        cfg: &HttpToolConfig,
        scope: &Scope<'_>,
        funcs: &FunctionRegistry,
        method: &str,
        url: &str,
    ) -> Result<PreparedRequest> {
        let mut query = Vec::new();
        for (name, template) in &cfg.query_params {
            query.push((name.clone(), resolve_text(template, scope, funcs)?));
        }

        let mut headers = Vec::new();
        for (name, template) in &cfg.headers {
            headers.push((name.clone(), resolve_text(template, scope, funcs)?));
        }

        let body = build_body(cfg, scope, funcs)?;

        Ok(PreparedRequest {
            method: method.to_owned(),
            url: url.to_owned(),
            query,
            headers,
            body,
            auth: cfg.auth.clone(),
            timeout: Duration::from_millis(
                cfg.timeout_ms.unwrap_or(self.defaults.default_timeout_ms),
            ),
        })
    }

    fn client_for(&self, cfg: &HttpToolConfig) -> &Client {
        if cfg.is_idempotent() {
            &self.redirecting
        } else {
            &self.direct
        }
    }

    fn build_request(&self, cfg: &HttpToolConfig, req: &PreparedRequest) -> Result<RequestBuilder> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| Error::Http(format!("invalid HTTP method '{}'", req.method)))?;

        let mut rb = self
            .client_for(cfg)
            .request(method, &req.url)
            .timeout(req.timeout);

        if !req.query.is_empty() {
            rb = rb.query(&req.query);
        }
        for (name, value) in &req.headers {
            rb = rb.header(name, value);
        }

        rb = match &req.body {
            BuiltBody::None => rb,
            BuiltBody::Json(value) => rb.json(value),
            BuiltBody::Form(pairs) => rb.form(pairs),
            BuiltBody::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in parts {
                    form = form.text(name.clone(), value.clone());
                }
                rb.multipart(form)
            }
            BuiltBody::Raw { content, mime } => rb
                .header(reqwest::header::CONTENT_TYPE, *mime)
                .body(content.clone()),
        };

        if let Some(auth) = &req.auth {
            rb = apply_auth(rb, auth, &req.method, &req.url, &req.body.canonical());
        }

        Ok(rb)
    }

    // ── retry engine ───────────────────────────────────────────────

    /// Send with retry + exponential back-off and jitter on transient
    /// failures (transport errors, 5xx, 429, 408). Other 4xx statuses
    /// are permanent.
    async fn execute_with_retry(
        &self,
        cfg: &HttpToolConfig,
        req: &PreparedRequest,
        cancel: Option<&CancellationToken>,
        info: &mut HttpCallInfo,
    ) -> Result<Value> {
        let retry = cfg.retry.unwrap_or(self.defaults.retry);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=retry.max {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(retry.base_delay_ms, attempt)).await;
            }
            info.attempts = attempt + 1;

            let rb = self.build_request(cfg, req)?;
            let started = Instant::now();
            let send = rb.send();

            let result = match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => {
                        return Err(Error::Cancelled(format!(
                            "{} aborted by host", info.signature
                        )));
                    }
                    result = send => result,
                },
                None => send.await,
            };

            tracing::debug!(
                signature = %info.signature,
                attempt,
                duration_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "http tool attempt"
            );

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return parse_response(resp).await;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let err = Error::HttpStatus {
                        status: status.as_u16(),
                        body,
                    };
                    if err.is_retryable() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    // Timeouts and connection errors are transient.
                    last_err = Some(from_reqwest(e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Http(format!("{}: all retries exhausted", info.signature))))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request pieces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PreparedRequest {
    method: String,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: BuiltBody,
    auth: Option<ToolAuth>,
    timeout: Duration,
}

enum BuiltBody {
    None,
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
    Raw { content: String, mime: &'static str },
}

impl BuiltBody {
    /// Textual form included in HMAC canonical strings.
    fn canonical(&self) -> String {
        match self {
            BuiltBody::None | BuiltBody::Multipart(_) => String::new(),
            BuiltBody::Json(value) => serde_json::to_string(value).unwrap_or_default(),
            BuiltBody::Form(pairs) => pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&"),
            BuiltBody::Raw { content, .. } => content.clone(),
        }
    }
}

/// Substitute `{name}` placeholders in the URL from `pathParams`,
/// percent-encoding each value.
fn substitute_path_params(
    cfg: &HttpToolConfig,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<String> {
    let mut url = cfg.url.clone();
    for (name, template) in &cfg.path_params {
        let value = resolve_text(template, scope, funcs)?;
        let encoded = utf8_percent_encode(&value, PATH_SEGMENT).to_string();
        url = url.replace(&format!("{{{name}}}"), &encoded);
    }
    Ok(url)
}

fn build_body(
    cfg: &HttpToolConfig,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<BuiltBody> {
    let method = cfg.method.to_ascii_uppercase();
    if matches!(method.as_str(), "GET" | "HEAD") {
        return Ok(BuiltBody::None);
    }

    // The body shape comes from the template when declared, otherwise the
    // whole argument object is sent.
    let shape = match &cfg.body_template {
        Some(template) => resolve_value(template, scope, funcs)?,
        None => scope
            .lookup_str("$args")?
            .unwrap_or(Value::Object(serde_json::Map::new())),
    };

    Ok(match cfg.content_type {
        ContentType::Json => BuiltBody::Json(shape),
        ContentType::Form => BuiltBody::Form(flatten_pairs(&shape)),
        ContentType::Multipart => BuiltBody::Multipart(flatten_pairs(&shape)),
        ContentType::Text => BuiltBody::Raw {
            content: value_as_text(&shape),
            mime: "text/plain",
        },
        ContentType::Xml => BuiltBody::Raw {
            content: value_as_text(&shape),
            mime: "application/xml",
        },
    })
}

/// Resolve a possibly-templated string.
fn resolve_text(template: &str, scope: &Scope<'_>, funcs: &FunctionRegistry) -> Result<String> {
    if template.contains("{{") {
        render(template, scope, funcs)
    } else {
        Ok(template.to_owned())
    }
}

/// Recursively resolve templated strings inside a JSON shape.
pub fn resolve_value(value: &Value, scope: &Scope<'_>, funcs: &FunctionRegistry) -> Result<Value> {
    Ok(match value {
        Value::String(text) if text.contains("{{") => Value::String(render(text, scope, funcs)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, scope, funcs))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(item, scope, funcs)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn flatten_pairs(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_as_text(v)))
            .collect(),
        _ => Vec::new(),
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => to_display(other),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authentication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn apply_auth(
    rb: RequestBuilder,
    auth: &ToolAuth,
    method: &str,
    url: &str,
    body: &str,
) -> RequestBuilder {
    match auth {
        ToolAuth::Bearer { token } => rb.bearer_auth(token),
        ToolAuth::Basic { username, password } => rb.basic_auth(username, Some(password)),
        ToolAuth::ApiKey { header, value } => rb.header(header, value),
        ToolAuth::Hmac { secret, header } => {
            rb.header(header, sign_hmac(secret, method, url, body))
        }
    }
}

/// HMAC-SHA256 over `METHOD\nURL\nBODY`, hex-encoded.
pub fn sign_hmac(secret: &str, method: &str, url: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(method.as_bytes());
    mac.update(b"\n");
    mac.update(url.as_bytes());
    mac.update(b"\n");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing & helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn parse_response(resp: reqwest::Response) -> Result<Value> {
    let declared = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let text = resp.text().await.map_err(from_reqwest)?;

    if declared.contains("json") {
        return serde_json::from_str(&text)
            .map_err(|e| Error::Http(format!("failed to parse JSON response: {e}")));
    }
    if declared.starts_with("text/") || declared.contains("xml") {
        return Ok(Value::String(text));
    }
    // Undeclared: detect JSON, fall back to raw text.
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Convert a `reqwest::Error` into a domain error. Timeouts become
/// `Error::Timeout`; everything else becomes `Error::Http`.
pub fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// `base·2ⁿ ± 25%` jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.pow(attempt.saturating_sub(1)));
    let quarter = (backoff / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..=quarter * 2);
    Duration::from_millis(backoff - quarter + jitter)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_cfg(spec: Value) -> HttpToolConfig {
        serde_json::from_value(spec).unwrap()
    }

    fn args_scope(args: &Value) -> Scope<'_> {
        Scope::default().with_args(args)
    }

    #[test]
    fn path_params_substitute_with_encoding() {
        let cfg = http_cfg(json!({
            "url": "https://api.example.com/users/{id}/files/{name}",
            "pathParams": {"id": "{{$args.id}}", "name": "{{$args.name}}"}
        }));
        let args = json!({"id": "u 7", "name": "a/b"});
        let funcs = FunctionRegistry::default();
        let url = substitute_path_params(&cfg, &args_scope(&args), &funcs).unwrap();
        assert_eq!(url, "https://api.example.com/users/u%207/files/a%2Fb");
    }

    #[test]
    fn body_defaults_to_args_for_post() {
        let cfg = http_cfg(json!({
            "url": "https://api.example.com/orders",
            "method": "POST"
        }));
        let args = json!({"sku": "X", "qty": 2});
        let funcs = FunctionRegistry::default();
        let body = build_body(&cfg, &args_scope(&args), &funcs).unwrap();
        match body {
            BuiltBody::Json(value) => assert_eq!(value, args),
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn body_template_renders_and_wins() {
        let cfg = http_cfg(json!({
            "url": "https://api.example.com/orders",
            "method": "POST",
            "bodyTemplate": {"item": "{{$args.sku}}", "fixed": true}
        }));
        let args = json!({"sku": "X9"});
        let funcs = FunctionRegistry::default();
        let body = build_body(&cfg, &args_scope(&args), &funcs).unwrap();
        match body {
            BuiltBody::Json(value) => {
                assert_eq!(value, json!({"item": "X9", "fixed": true}));
            }
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn form_body_flattens_scalars() {
        let cfg = http_cfg(json!({
            "url": "https://api.example.com/submit",
            "method": "POST",
            "contentType": "application/x-www-form-urlencoded"
        }));
        let args = json!({"a": 1, "b": "two"});
        let funcs = FunctionRegistry::default();
        let body = build_body(&cfg, &args_scope(&args), &funcs).unwrap();
        match body {
            BuiltBody::Form(pairs) => {
                assert!(pairs.contains(&("a".to_owned(), "1".to_owned())));
                assert!(pairs.contains(&("b".to_owned(), "two".to_owned())));
            }
            _ => panic!("expected form body"),
        }
    }

    #[test]
    fn get_has_no_body() {
        let cfg = http_cfg(json!({"url": "https://api.example.com/x"}));
        let funcs = FunctionRegistry::default();
        let args = json!({});
        let body = build_body(&cfg, &args_scope(&args), &funcs).unwrap();
        assert!(matches!(body, BuiltBody::None));
    }

    #[test]
    fn hmac_signature_is_deterministic() {
        let a = sign_hmac("secret", "POST", "https://x/y", "{}");
        let b = sign_hmac("secret", "POST", "https://x/y", "{}");
        let c = sign_hmac("secret", "POST", "https://x/y", "{\"k\":1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        for _ in 0..20 {
            let first = backoff_delay(100, 1);
            let third = backoff_delay(100, 3);
            assert!(first >= Duration::from_millis(75));
            assert!(first <= Duration::from_millis(125));
            assert!(third >= Duration::from_millis(300));
            assert!(third <= Duration::from_millis(500));
        }
    }

    #[test]
    fn canonical_body_shapes() {
        assert_eq!(BuiltBody::None.canonical(), "");
        assert_eq!(BuiltBody::Json(json!({"a": 1})).canonical(), "{\"a\":1}");
        assert_eq!(
            BuiltBody::Form(vec![("a".into(), "1".into()), ("b".into(), "2".into())]).canonical(),
            "a=1&b=2"
        );
    }
}
