//! Per-call execution trace.
//!
//! An [`ExecutionContext`] is created at the start of every public engine
//! operation and passed down by `&mut`. It is never shared between calls:
//! concurrent operations each own their own context. Dropping an
//! unfinished context still emits its report, so early returns cannot leak
//! a trace into a later call.

use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::template::{cached_regex, split_quoted};
use crate::config::EngineSettings;
use crate::error::{EngineError, ErrorContext, Result};
use crate::value::CellValue;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Sql { sql: String, params: Vec<CellValue> },
    Log(String),
}

pub struct ExecutionContext {
    uid: u64,
    kind: &'static str,
    statement: String,
    dialect: Option<String>,
    started: Instant,
    steps: Vec<Step>,
    error: Option<String>,
    slow_after: Duration,
    print_sql: bool,
    backtrace: Option<Backtrace>,
    finished: bool,
}

impl ExecutionContext {
    pub fn start(kind: &'static str, statement: impl Into<String>, settings: &EngineSettings) -> Self {
        Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            kind,
            statement: statement.into(),
            dialect: None,
            started: Instant::now(),
            steps: Vec::new(),
            error: None,
            slow_after: Duration::from_millis(settings.slow_sql_millis),
            print_sql: settings.print_sql,
            // symbols are only resolved if the call fails
            backtrace: Some(Backtrace::force_capture()),
            finished: false,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn set_dialect(&mut self, dialect: &str) {
        self.dialect = Some(dialect.to_string());
    }

    pub fn record_sql(&mut self, sql: &str, params: &[CellValue]) {
        self.steps.push(Step::Sql {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.steps.push(Step::Log(message.into()));
    }

    pub fn sql_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Sql { .. }))
            .count()
    }

    pub fn logs(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match s {
            Step::Log(m) => Some(m.as_str()),
            Step::Sql { .. } => None,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Statement, dialect and the first calling frame outside this crate.
    pub fn error_context(&mut self) -> ErrorContext {
        let caller = self
            .backtrace
            .take()
            .map(|bt| first_external_frame(&bt.to_string()).unwrap_or_else(|| "unknown".to_string()));
        ErrorContext {
            statement: Some(self.statement.clone()),
            dialect: self.dialect.clone(),
            caller,
        }
    }

    /// Attach this call's context to an error and remember it for the
    /// report.
    pub fn fail(&mut self, err: EngineError) -> EngineError {
        let context = self.error_context();
        let err = err.with_context(&context);
        self.error = Some(err.to_string());
        err
    }

    /// Finish the trace with the call's outcome.
    pub fn complete<T>(mut self, result: Result<T>) -> Result<T> {
        let result = result.map_err(|e| self.fail(e));
        self.finish();
        result
    }

    pub fn finish(mut self) {
        self.report();
    }

    fn report(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let elapsed = self.started.elapsed();
        if let Some(err) = &self.error {
            tracing::error!(uid = self.uid, kind = self.kind, "{}\n{}", err, self.render(elapsed));
        } else if elapsed >= self.slow_after {
            tracing::warn!(
                uid = self.uid,
                kind = self.kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow statement\n{}",
                self.render(elapsed)
            );
        } else if self.print_sql {
            tracing::debug!(uid = self.uid, kind = self.kind, "{}", self.render(elapsed));
        }
    }

    fn render(&self, elapsed: Duration) -> String {
        let mut out = format!(
            "[{}] {} `{}` dialect={} took {}ms",
            self.uid,
            self.kind,
            self.statement,
            self.dialect.as_deref().unwrap_or("-"),
            elapsed.as_millis()
        );
        for step in &self.steps {
            match step {
                Step::Sql { sql, params } => {
                    let _ = write!(out, "\n  sql: {}", fit_sql_params(sql, params));
                }
                Step::Log(m) => {
                    let _ = write!(out, "\n  log: {}", m);
                }
            }
        }
        out
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.report();
    }
}

fn literal(value: &CellValue) -> String {
    match value {
        CellValue::Null => "null".to_string(),
        CellValue::Bool(_)
        | CellValue::Int16(_)
        | CellValue::Int32(_)
        | CellValue::Int64(_)
        | CellValue::Float32(_)
        | CellValue::Float64(_) => value.display(),
        other => format!("'{}'", other.display().replace('\'', "''")),
    }
}

/// SQL with each placeholder replaced by its value, for reading only.
/// Handles `?` as well as the numbered `$n`, `:n` and `@Pn` styles.
pub fn fit_sql_params(sql: &str, params: &[CellValue]) -> String {
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    let parts = split_quoted(sql);
    let question_marks = parts
        .iter()
        .any(|(quoted, part)| !quoted && part.contains('?'));
    let numbered = cached_regex(&NUMBERED, r"(\$|:|@P)(\d+)");
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next = 0usize;
    for (quoted, part) in parts {
        if quoted {
            out.push_str(&part);
        } else if question_marks {
            for c in part.chars() {
                if c == '?' {
                    match params.get(next) {
                        Some(v) => out.push_str(&literal(v)),
                        None => out.push('?'),
                    }
                    next += 1;
                } else {
                    out.push(c);
                }
            }
        } else {
            match numbered {
                Some(re) => out.push_str(&re.replace_all(&part, |caps: &regex::Captures| {
                    let index: usize = caps[2].parse().unwrap_or(0);
                    match index.checked_sub(1).and_then(|i| params.get(i)) {
                        Some(v) => literal(v),
                        None => caps[0].to_string(),
                    }
                })),
                None => out.push_str(&part),
            }
        }
    }
    out
}

const INTERNAL_PREFIXES: &[&str] = &[
    "sqlweave::",
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "futures_util::",
    "futures_core::",
    "async_trait::",
    "__rust",
    "rust_begin_unwind",
];

fn is_internal(symbol: &str) -> bool {
    let bare = symbol.trim_start_matches('<');
    INTERNAL_PREFIXES.iter().any(|p| bare.starts_with(p)) || symbol.contains("sqlweave::")
}

/// First frame of a rendered backtrace that belongs to neither this crate
/// nor the runtime, with its source location when present.
pub fn first_external_frame(backtrace: &str) -> Option<String> {
    static FRAME: OnceLock<Option<Regex>> = OnceLock::new();
    static HASH: OnceLock<Option<Regex>> = OnceLock::new();
    let frame = cached_regex(&FRAME, r"^\s*\d+:\s+(.+)$")?;
    let hash = cached_regex(&HASH, r"::h[0-9a-f]{16}$");
    let mut lines = backtrace.lines().peekable();
    while let Some(line) = lines.next() {
        let Some(caps) = frame.captures(line) else {
            continue;
        };
        let mut symbol = caps[1].trim().to_string();
        if let Some(re) = hash {
            symbol = re.replace(&symbol, "").into_owned();
        }
        if is_internal(&symbol) {
            continue;
        }
        let location = lines
            .peek()
            .and_then(|next| next.trim().strip_prefix("at "))
            .map(str::to_string);
        return Some(match location {
            Some(at) => format!("{} ({})", symbol, at),
            None => symbol,
        });
    }
    None
}
