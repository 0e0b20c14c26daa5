// src/trace.rs

//! Cross-cutting enter/leave accounting and CSV access logging (spec §4.10,
//! C10). Ambient: enabling or disabling any sink here must never change the
//! behavior of any other component — only what gets logged.
//!
//! Sits beside ordinary `tracing::{debug,info,warn}` calls used elsewhere in
//! this crate the way the teacher uses `tracing` throughout its connection
//! and cluster layers; `JULEA_TRACE_FUNCTION` glob whitelisting is
//! implemented with the teacher's own `wildmatch` dependency
//! (`core/commands/helpers.rs`'s `WildMatch::new(pattern).matches(..)`).

use bitflags::bitflags;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use wildmatch::WildMatch;

bitflags! {
    /// Which sinks `JULEA_TRACE` enables (spec §4.10, §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceSinks: u8 {
        const ECHO    = 0b0001;
        const OTF     = 0b0010;
        const SUMMARY = 0b0100;
        const ACCESS  = 0b1000;
    }
}

impl TraceSinks {
    /// Parses the comma list from `JULEA_TRACE` (spec §6). Unknown tokens
    /// are ignored, matching the permissive style of the teacher's config
    /// parsing (unknown TOML keys are simply not recognized rather than
    /// rejected).
    pub fn parse(value: &str) -> Self {
        let mut sinks = TraceSinks::empty();
        for token in value.split(',') {
            match token.trim() {
                "echo" => sinks |= TraceSinks::ECHO,
                "otf" => sinks |= TraceSinks::OTF,
                "summary" => sinks |= TraceSinks::SUMMARY,
                "access" => sinks |= TraceSinks::ACCESS,
                _ => {}
            }
        }
        sinks
    }

    pub fn from_env() -> Self {
        std::env::var("JULEA_TRACE")
            .map(|v| Self::parse(&v))
            .unwrap_or_else(|_| TraceSinks::empty())
    }
}

/// `JULEA_TRACE_FUNCTION` glob whitelist (spec §6). An empty whitelist
/// allows everything, matching "no filter configured => trace everything
/// enabled sinks would otherwise trace."
#[derive(Debug, Clone, Default)]
pub struct FunctionFilter {
    patterns: Vec<String>,
}

impl FunctionFilter {
    pub fn from_env() -> Self {
        let patterns = std::env::var("JULEA_TRACE_FUNCTION")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        Self { patterns }
    }

    pub fn allows(&self, function_name: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| WildMatch::new(p).matches(function_name))
    }
}

/// One CSV access-log row (spec §4.10 "access" mode field list).
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub time: u64,
    pub uid: u32,
    pub program: String,
    pub backend: String,
    pub op_type: String,
    pub path: String,
    pub namespace: String,
    pub name: String,
    pub op: String,
    pub size: u64,
    pub complexity: f64,
    pub duration_micros: u64,
    pub bson_args: String,
}

impl AccessRecord {
    fn to_csv_row(&self) -> String {
        let mut row = String::new();
        let _ = write!(
            row,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.time,
            self.uid,
            csv_escape(&self.program),
            csv_escape(&self.backend),
            csv_escape(&self.op_type),
            csv_escape(&self.path),
            csv_escape(&self.namespace),
            csv_escape(&self.name),
            csv_escape(&self.op),
            self.size,
            self.complexity,
            self.duration_micros,
            csv_escape(&self.bson_args),
        );
        row
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Per-thread trace context: a current nesting depth plus an id string
/// (spec §4.10 "every thread has a private trace context").
struct ThreadContext {
    depth: RefCell<u32>,
    id: String,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext {
        depth: RefCell::new(0),
        id: format!("{:?}", std::thread::current().id()),
    };
}

static SINKS: OnceLock<TraceSinks> = OnceLock::new();
static FUNCTION_FILTER: OnceLock<FunctionFilter> = OnceLock::new();

/// Reads `JULEA_TRACE`/`JULEA_TRACE_FUNCTION` once and caches the result for
/// the process's lifetime, mirroring env-driven one-shot config the way the
/// teacher reads its own environment-derived settings at startup.
fn sinks() -> TraceSinks {
    *SINKS.get_or_init(TraceSinks::from_env)
}

fn function_filter() -> &'static FunctionFilter {
    FUNCTION_FILTER.get_or_init(FunctionFilter::from_env)
}

/// A scoped trace span, created by `enter` and closed by `leave` (spec
/// §4.10). Dropping without calling `leave` still decrements the depth (via
/// `Drop`) so a caller that returns early through `?` doesn't leak depth.
pub struct Trace {
    name: String,
    started: Instant,
    active: bool,
}

/// Opens a scoped trace: increments this thread's depth, and — if `echo` is
/// enabled and `name` passes the function filter — emits a `tracing::trace!`
/// line (spec §4.10 `enter`).
pub fn enter(name: &str) -> Trace {
    let depth = CONTEXT.with(|ctx| {
        let mut depth = ctx.depth.borrow_mut();
        let current = *depth;
        *depth += 1;
        current
    });
    if sinks().contains(TraceSinks::ECHO) && function_filter().allows(name) {
        tracing::trace!(depth, function = name, "enter");
    }
    Trace {
        name: name.to_string(),
        started: Instant::now(),
        active: true,
    }
}

/// Closes a scoped trace opened by `enter` (spec §4.10 `leave`).
pub fn leave(mut trace: Trace) {
    trace.close();
}

impl Trace {
    fn close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        CONTEXT.with(|ctx| {
            let mut depth = ctx.depth.borrow_mut();
            *depth = depth.saturating_sub(1);
        });
        if sinks().contains(TraceSinks::ECHO) && function_filter().allows(&self.name) {
            tracing::trace!(
                function = %self.name,
                elapsed_micros = self.started.elapsed().as_micros() as u64,
                "leave"
            );
        }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.close();
    }
}

/// Emits one CSV access-log row if the `access` sink is enabled (spec §4.10
/// "in access mode, a CSV row is emitted per backend call").
pub fn record_access(record: AccessRecord) {
    if !sinks().contains(TraceSinks::ACCESS) {
        return;
    }
    tracing::info!(target: "julea_core::access", csv = %record.to_csv_row());
}

pub fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
