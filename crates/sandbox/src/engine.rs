//! Execution engine: runs one automation script in a fresh isolate.
//!
//! Every execution gets its own `boa_engine::Context` on a dedicated OS
//! thread. Nothing survives between executions, so no global state set by
//! one script is ever visible to the next.
//!
//! The script source is wrapped in a CommonJS envelope and its
//! `module.exports` is classified into a [`ScriptEntryPoint`]. The entry
//! point is invoked with `(event, context)` and the returned value or
//! promise is driven to completion by an event loop that:
//!
//! 1. drains the microtask queue,
//! 2. fires due timers,
//! 3. starts queued host requests (fetch, secrets) as tasks on the host
//!    runtime and aborts the ones the script gave up on,
//! 4. waits for the next host reply or the next timer, whichever is first.
//!
//! Wall-clock time is enforced twice. The loop checks its deadline between
//! steps, and boa's loop-iteration and recursion limits abort synchronous
//! busy work with an uncatchable error. A watchdog on the async side
//! returns `TimedOut` if the isolate thread does not answer in time.

use std::thread;
use std::time::{Duration, Instant};

use boa_engine::{Context, JsError, JsObject, JsString, JsValue, Script, Source};
use evidence_core::execution::{ErrorKind, ExecutionReport, InvocationContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::capabilities::{CapabilitySurface, HostCalls, HostReply, HostRequest};

/// JavaScript half of the capability surface.
const PRELUDE: &str = include_str!("prelude.js");

/// Default wall-clock budget for one execution.
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Extra time the watchdog allows the isolate to report on its own.
const WATCHDOG_GRACE: Duration = Duration::from_millis(500);

/// Stack size of the isolate thread. Deep recursion is bounded separately by
/// the recursion limit.
const ISOLATE_STACK_BYTES: usize = 16 * 1024 * 1024;

/// Resource limits applied to every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub max_source_bytes: usize,
    pub max_output_bytes: usize,
    pub max_log_lines: usize,
    pub max_log_line_chars: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            loop_iteration_limit: 50_000_000,
            recursion_limit: 512,
            max_source_bytes: 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_log_lines: 1_000,
            max_log_line_chars: 4_096,
        }
    }
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Everything one execution needs besides its capabilities.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub source: String,
    pub event: Value,
    pub context: InvocationContext,
}

/// How a module's exports are invoked.
#[derive(Debug, Clone)]
pub enum ScriptEntryPoint {
    /// `module.exports = function (event, context) { ... }`
    Direct(JsObject),
    /// `module.exports = { handler }`, called with the exports object as
    /// `this`.
    Wrapped { handler: JsObject, receiver: JsObject },
}

#[derive(Debug, Clone)]
pub struct Engine {
    limits: ExecutionLimits,
}

impl Engine {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run `job` in a fresh isolate and report its outcome.
    ///
    /// Must be called from within a Tokio runtime. Never returns an error:
    /// every failure mode is classified into the report.
    pub async fn execute(&self, job: ExecutionJob, surface: CapabilitySurface) -> ExecutionReport {
        let limits = self.limits;
        let run_id = job.context.run_id.clone();
        let runtime = Handle::current();
        let (tx, rx) = oneshot::channel();

        let spawned = thread::Builder::new()
            .name("evidence-isolate".into())
            .stack_size(ISOLATE_STACK_BYTES)
            .spawn(move || {
                let report = run_isolate(job, surface, limits, runtime);
                let _ = tx.send(report);
            });

        if let Err(e) = spawned {
            tracing::error!(run_id = %run_id, error = %e, "Failed to spawn isolate thread");
            return ExecutionReport::failure(
                ErrorKind::SandboxUnavailable,
                format!("failed to start isolate: {e}"),
                Vec::new(),
            );
        }

        match tokio::time::timeout(limits.timeout() + WATCHDOG_GRACE, rx).await {
            Ok(Ok(report)) => report,
            Ok(Err(_)) => ExecutionReport::failure(
                ErrorKind::ScriptError,
                "isolate terminated without reporting",
                Vec::new(),
            ),
            Err(_) => {
                tracing::warn!(run_id = %run_id, timeout_ms = limits.timeout_ms, "Isolate watchdog fired");
                ExecutionReport::failure(
                    ErrorKind::TimedOut,
                    format!("execution exceeded {} ms", limits.timeout_ms),
                    Vec::new(),
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Isolate
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn bootstrap(message: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::SandboxUnavailable,
            format!("isolate bootstrap failed: {message}"),
        )
    }
}

/// Handles returned by the prelude.
struct HostInterface {
    load: JsObject,
    invoke: JsObject,
    step: JsObject,
    resolve: JsObject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    settled: Option<Settled>,
    #[serde(default)]
    requests: Vec<HostRequest>,
    #[serde(default)]
    canceled: Vec<u64>,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    dropped_logs: u64,
    #[serde(default)]
    fired: u32,
    next_timer_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Settled {
    ok: bool,
    json: Option<String>,
    message: Option<String>,
}

struct Isolate {
    context: Context,
    host: HostInterface,
    logs: Vec<String>,
    dropped_logs: u64,
    run_id: String,
}

fn run_isolate(
    job: ExecutionJob,
    surface: CapabilitySurface,
    limits: ExecutionLimits,
    runtime: Handle,
) -> ExecutionReport {
    let deadline = Instant::now() + limits.timeout();
    let run_id = job.context.run_id.to_string();

    let mut isolate = match Isolate::boot(&surface, &limits, run_id) {
        Ok(isolate) => isolate,
        Err(failure) => {
            return ExecutionReport::failure(failure.kind, failure.message, Vec::new())
        }
    };

    let mut calls = HostCalls::new(runtime, surface);
    let outcome = isolate.run(&job, &limits, &mut calls, deadline);
    drop(calls);
    let logs = isolate.into_logs();
    match outcome {
        Ok(result) => ExecutionReport::success(result, logs),
        Err(failure) => ExecutionReport::failure(failure.kind, failure.message, logs),
    }
}

fn js_string(value: &str) -> JsValue {
    JsValue::from(JsString::from(value))
}

fn method(host: &JsObject, name: &str, context: &mut Context) -> Result<JsObject, Failure> {
    host.get(JsString::from(name), context)
        .map_err(Failure::bootstrap)?
        .as_callable()
        .cloned()
        .ok_or_else(|| Failure::bootstrap(format!("prelude is missing {name}")))
}

/// Call into the prelude. The prelude catches every script exception, so an
/// error escaping here is one of boa's uncatchable runtime-limit errors.
fn call(function: &JsObject, args: &[JsValue], context: &mut Context) -> Result<JsValue, Failure> {
    function
        .call(&JsValue::undefined(), args, context)
        .map_err(limit_exceeded)
}

fn limit_exceeded(err: JsError) -> Failure {
    Failure::new(
        ErrorKind::TimedOut,
        format!("execution limits exceeded: {err}"),
    )
}

fn type_name(value: &JsValue) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_symbol() {
        "symbol"
    } else if value.is_bigint() {
        "bigint"
    } else {
        "object"
    }
}

/// Decide how `exports` is invoked.
fn classify(exports: &JsValue, context: &mut Context) -> Result<ScriptEntryPoint, Failure> {
    if let Some(function) = exports.as_callable() {
        return Ok(ScriptEntryPoint::Direct(function.clone()));
    }
    if let Some(object) = exports.as_object() {
        let handler = object
            .get(JsString::from("handler"), context)
            .map_err(|e| Failure::new(ErrorKind::ScriptError, e.to_string()))?;
        if let Some(handler) = handler.as_callable() {
            return Ok(ScriptEntryPoint::Wrapped {
                handler: handler.clone(),
                receiver: object.clone(),
            });
        }
    }
    Err(Failure::new(
        ErrorKind::InvalidExport,
        format!(
            "module.exports must be a function or an object with a handler function, got {}",
            type_name(exports)
        ),
    ))
}

impl Isolate {
    fn boot(
        surface: &CapabilitySurface,
        limits: &ExecutionLimits,
        run_id: String,
    ) -> Result<Self, Failure> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit);

        crate::capabilities::install_natives(&mut context).map_err(Failure::bootstrap)?;

        let bootstrap = context
            .eval(Source::from_bytes(PRELUDE.as_bytes()))
            .map_err(Failure::bootstrap)?;
        let bootstrap = bootstrap
            .as_callable()
            .cloned()
            .ok_or_else(|| Failure::bootstrap("prelude is not a function"))?;

        let config = surface.prelude_config(limits);
        let host = bootstrap
            .call(&JsValue::undefined(), &[js_string(&config)], &mut context)
            .map_err(Failure::bootstrap)?;
        let host = host
            .as_object()
            .cloned()
            .ok_or_else(|| Failure::bootstrap("prelude returned no host interface"))?;

        let host = HostInterface {
            load: method(&host, "load", &mut context)?,
            invoke: method(&host, "invoke", &mut context)?,
            step: method(&host, "step", &mut context)?,
            resolve: method(&host, "resolve", &mut context)?,
        };

        Ok(Self {
            context,
            host,
            logs: Vec::new(),
            dropped_logs: 0,
            run_id,
        })
    }

    fn run(
        &mut self,
        job: &ExecutionJob,
        limits: &ExecutionLimits,
        calls: &mut HostCalls,
        deadline: Instant,
    ) -> Result<Value, Failure> {
        if job.source.len() > limits.max_source_bytes {
            return Err(Failure::new(
                ErrorKind::CompileError,
                format!(
                    "script is {} bytes, the limit is {}",
                    job.source.len(),
                    limits.max_source_bytes
                ),
            ));
        }

        let entry = self.load(&job.source)?;
        let (handler, receiver) = match entry {
            ScriptEntryPoint::Direct(function) => (function, JsValue::undefined()),
            ScriptEntryPoint::Wrapped { handler, receiver } => (handler, JsValue::from(receiver)),
        };

        let event = serde_json::to_string(&job.event)
            .map_err(|e| Failure::new(ErrorKind::ScriptError, format!("event: {e}")))?;
        let context = serde_json::to_string(&job.context)
            .map_err(|e| Failure::new(ErrorKind::ScriptError, format!("context: {e}")))?;

        let invoke = self.host.invoke.clone();
        call(
            &invoke,
            &[
                JsValue::from(handler),
                receiver,
                js_string(&event),
                js_string(&context),
            ],
            &mut self.context,
        )?;

        self.drive(limits, calls, deadline)
    }

    /// Compile the module envelope, evaluate it and classify its exports.
    fn load(&mut self, source: &str) -> Result<ScriptEntryPoint, Failure> {
        let envelope = format!("(function (module, exports, require) {{\n{source}\n}})");
        let script = Script::parse(Source::from_bytes(envelope.as_bytes()), None, &mut self.context)
            .map_err(|e| Failure::new(ErrorKind::CompileError, e.to_string()))?;
        let factory = script
            .evaluate(&mut self.context)
            .map_err(|e| Failure::new(ErrorKind::ScriptError, e.to_string()))?;
        if factory.as_callable().is_none() {
            return Err(Failure::new(
                ErrorKind::CompileError,
                "script escapes its module wrapper",
            ));
        }

        let load = self.host.load.clone();
        let loaded = call(&load, &[factory], &mut self.context)?;
        if let Some(message) = loaded.as_string() {
            return Err(Failure::new(
                ErrorKind::ScriptError,
                message.to_std_string_escaped(),
            ));
        }
        let exports = loaded
            .as_object()
            .cloned()
            .ok_or_else(|| Failure::bootstrap("load returned no exports"))?
            .get(JsString::from("exports"), &mut self.context)
            .map_err(limit_exceeded)?;

        classify(&exports, &mut self.context)
    }

    /// Event loop: run until the invocation settles or the deadline passes.
    fn drive(
        &mut self,
        limits: &ExecutionLimits,
        calls: &mut HostCalls,
        deadline: Instant,
    ) -> Result<Value, Failure> {
        let step = self.host.step.clone();

        loop {
            self.context.run_jobs();

            let raw = call(&step, &[], &mut self.context)?;
            let snapshot = self.snapshot(&raw)?;
            self.collect_logs(snapshot.logs, snapshot.dropped_logs);

            if let Some(settled) = snapshot.settled {
                return finish(settled, limits);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(limits));
            }
            let remaining = deadline - now;

            for id in snapshot.canceled {
                calls.cancel(id);
            }
            for request in snapshot.requests {
                calls.start(request, remaining);
            }

            if snapshot.fired > 0 {
                let replies = calls.wait(Duration::ZERO);
                self.deliver(replies)?;
                continue;
            }

            let wait = match snapshot.next_timer_ms {
                Some(ms) => Duration::from_millis(ms).min(remaining),
                None if calls.in_flight() > 0 => remaining,
                None => {
                    return Err(Failure::new(
                        ErrorKind::ScriptError,
                        "handler returned a promise that never settled",
                    ))
                }
            };
            let replies = calls.wait(wait);
            self.deliver(replies)?;
        }
    }

    /// Settle the promises behind `replies`.
    fn deliver(&mut self, replies: Vec<HostReply>) -> Result<(), Failure> {
        let resolve = self.host.resolve.clone();
        for reply in replies {
            call(
                &resolve,
                &[
                    JsValue::from(reply.id as f64),
                    JsValue::from(reply.ok),
                    js_string(&reply.payload.to_string()),
                ],
                &mut self.context,
            )?;
        }
        Ok(())
    }

    fn snapshot(&self, raw: &JsValue) -> Result<Snapshot, Failure> {
        let text = raw
            .as_string()
            .map(JsString::to_std_string_escaped)
            .ok_or_else(|| Failure::bootstrap("step returned a non-string"))?;
        serde_json::from_str(&text).map_err(|e| Failure::bootstrap(format!("step snapshot: {e}")))
    }

    fn collect_logs(&mut self, lines: Vec<String>, dropped: u64) {
        for line in &lines {
            tracing::debug!(run_id = %self.run_id, "script: {line}");
        }
        self.logs.extend(lines);
        self.dropped_logs += dropped;
    }

    fn into_logs(mut self) -> Vec<String> {
        if self.dropped_logs > 0 {
            self.logs
                .push(format!("[evidence] {} log lines dropped", self.dropped_logs));
        }
        self.logs
    }
}

fn timed_out(limits: &ExecutionLimits) -> Failure {
    Failure::new(
        ErrorKind::TimedOut,
        format!("execution exceeded {} ms", limits.timeout_ms),
    )
}

fn finish(settled: Settled, limits: &ExecutionLimits) -> Result<Value, Failure> {
    if !settled.ok {
        return Err(Failure::new(
            ErrorKind::ScriptError,
            settled.message.unwrap_or_else(|| "script failed".into()),
        ));
    }
    let json = settled.json.unwrap_or_else(|| "null".into());
    if json.len() > limits.max_output_bytes {
        return Err(Failure::new(
            ErrorKind::ScriptError,
            format!(
                "result is {} bytes, the limit is {}",
                json.len(),
                limits.max_output_bytes
            ),
        ));
    }
    serde_json::from_str(&json)
        .map_err(|e| Failure::new(ErrorKind::ScriptError, format!("result is not valid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
