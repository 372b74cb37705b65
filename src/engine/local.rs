//! Built-in line-oriented script engine.
//!
//! `LocalEngine` executes a deterministic statement language, enough to
//! exercise every seam feature without an external engine: worker-scope
//! variables that persist across tasks, positional arguments, all three
//! capture streams, cooperative cancellation, and module imports validated
//! against the search path.
//!
//! # Statement Language
//!
//! One statement per line (or `;`-separated); `#` starts a comment line.
//!
//! | Statement | Effect |
//! |---|---|
//! | `sleep <ms>` | Pause, honoring the stop token |
//! | `emit <text>` | Append an output item |
//! | `error <text>` | Append an error item |
//! | `progress <pct> <text>` | Emit a progress record |
//! | `set <name> <text>` | Set a worker-scope variable |
//! | `incr <name>` | Increment a numeric worker-scope variable |
//! | `get <name>` | Emit a variable's value as output |
//! | `fail <text>` | Abort the script with an error |
//!
//! `$0`, `$1`, … interpolate positional arguments; `$name` interpolates a
//! worker-scope variable (case-insensitive). Unknown statements are rejected
//! before anything runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ModuleCheckResult;
use crate::core::task::ProgressRecord;
use crate::engine::context::{EngineError, ScriptEngine, StreamSink, WorkerContext, WorkerTemplate};
use crate::engine::probe;

/// The built-in deterministic script engine.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    path_var: String,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self {
            path_var: probe::MODULE_PATH_VAR.to_string(),
        }
    }
}

impl LocalEngine {
    /// Use a non-default module-search-path variable (test isolation).
    #[must_use]
    pub fn with_path_var(var: impl Into<String>) -> Self {
        Self {
            path_var: var.into(),
        }
    }
}

impl ScriptEngine for LocalEngine {
    type Context = LocalWorker;

    fn create_context(&self, template: &WorkerTemplate) -> Result<Self::Context, EngineError> {
        tracing::debug!(
            modules = template.modules().len(),
            variables = template.variables().len(),
            "materializing local worker context"
        );
        Ok(LocalWorker {
            modules: template.modules().to_vec(),
            variables: template.variables().clone(),
        })
    }

    fn probe_module(&self, name: &str) -> ModuleCheckResult {
        probe::check_with_var(name, &self.path_var)
    }

    fn module_search_path(&self) -> String {
        probe::search_path(&self.path_var)
    }
}

/// A reusable worker context of the local engine.
///
/// The variable scope persists across `run` calls, which is what makes
/// one-shot init effects observable from every later task on this worker.
pub struct LocalWorker {
    modules: Vec<String>,
    variables: HashMap<String, Value>,
}

impl LocalWorker {
    /// Modules this worker was materialized with.
    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    fn resolve(&self, ident: &str, arguments: &[Value]) -> Value {
        if let Ok(index) = ident.parse::<usize>() {
            return arguments.get(index).cloned().unwrap_or(Value::Null);
        }
        self.variables
            .get(&ident.to_ascii_lowercase())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn interpolate(&self, text: &str, arguments: &[Value]) -> String {
        let mut out = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut ident = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    ident.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if ident.is_empty() {
                out.push('$');
            } else {
                out.push_str(&render(&self.resolve(&ident, arguments)));
            }
        }
        out
    }

    fn counter_value(&self, name: &str) -> i64 {
        match self.variables.get(&name.to_ascii_lowercase()) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn literal(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(text),
    }
}

enum Statement {
    Sleep(String),
    Emit(String),
    ErrorOut(String),
    Progress { percent: String, activity: String },
    Set { name: String, value: String },
    Incr(String),
    Get(String),
    Fail(String),
}

fn rejected(reason: impl Into<String>) -> EngineError {
    EngineError::Rejected(reason.into())
}

fn parse(script: &str) -> Result<Vec<Statement>, EngineError> {
    let mut statements = Vec::new();
    for raw in script.split(['\n', ';']) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };
        let statement = match keyword {
            "sleep" => {
                // Literal operands are validated up front; `$`-operands are
                // resolved per run.
                if !rest.contains('$') && rest.parse::<u64>().is_err() {
                    return Err(rejected(format!("sleep wants milliseconds, got `{rest}`")));
                }
                Statement::Sleep(rest.to_string())
            }
            "emit" => Statement::Emit(rest.to_string()),
            "error" => Statement::ErrorOut(rest.to_string()),
            "progress" => {
                let (percent, activity) = match rest.split_once(char::is_whitespace) {
                    Some((percent, activity)) => (percent, activity.trim()),
                    None => (rest, ""),
                };
                if !percent.contains('$') && percent.parse::<i32>().is_err() {
                    return Err(rejected(format!(
                        "progress wants a percentage, got `{percent}`"
                    )));
                }
                Statement::Progress {
                    percent: percent.to_string(),
                    activity: activity.to_string(),
                }
            }
            "set" => {
                let (name, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| rejected("set wants a name and a value"))?;
                Statement::Set {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                }
            }
            "incr" if !rest.is_empty() => Statement::Incr(rest.to_string()),
            "get" if !rest.is_empty() => Statement::Get(rest.to_string()),
            "fail" => Statement::Fail(rest.to_string()),
            other => return Err(rejected(format!("unrecognized statement `{other}`"))),
        };
        statements.push(statement);
    }
    Ok(statements)
}

#[async_trait]
impl WorkerContext for LocalWorker {
    async fn run(
        &mut self,
        script: &str,
        arguments: &[Value],
        sink: &dyn StreamSink,
        stop: &CancellationToken,
    ) -> Result<(), EngineError> {
        // Whole-script parse up front: a bad script is rejected before any
        // statement runs.
        let statements = parse(script)?;

        for statement in &statements {
            if stop.is_cancelled() {
                return Err(EngineError::Interrupted);
            }
            match statement {
                Statement::Sleep(raw) => {
                    let rendered = self.interpolate(raw, arguments);
                    let ms: u64 = rendered.parse().map_err(|_| {
                        EngineError::Script(format!("sleep wants milliseconds, got `{rendered}`"))
                    })?;
                    tokio::select! {
                        () = stop.cancelled() => return Err(EngineError::Interrupted),
                        () = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                }
                Statement::Emit(raw) => {
                    sink.output(Value::from(self.interpolate(raw, arguments)));
                }
                Statement::ErrorOut(raw) => {
                    sink.error(Value::from(self.interpolate(raw, arguments)));
                }
                Statement::Progress { percent, activity } => {
                    let rendered = self.interpolate(percent, arguments);
                    let percent: i32 = rendered.parse().map_err(|_| {
                        EngineError::Script(format!(
                            "progress wants a percentage, got `{rendered}`"
                        ))
                    })?;
                    let activity = if activity.is_empty() {
                        "working".to_string()
                    } else {
                        self.interpolate(activity, arguments)
                    };
                    sink.progress(ProgressRecord {
                        activity,
                        percent_complete: Some(percent),
                        status_description: None,
                    });
                }
                Statement::Set { name, value } => {
                    let value = literal(&self.interpolate(value, arguments));
                    self.variables.insert(name.to_ascii_lowercase(), value);
                }
                Statement::Incr(name) => {
                    let next = self.counter_value(name) + 1;
                    self.variables
                        .insert(name.to_ascii_lowercase(), Value::from(next));
                }
                Statement::Get(name) => {
                    sink.output(self.resolve(name, arguments));
                }
                Statement::Fail(raw) => {
                    let reason = if raw.is_empty() {
                        "script failure".to_string()
                    } else {
                        self.interpolate(raw, arguments)
                    };
                    return Err(EngineError::Script(reason));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        output: Mutex<Vec<Value>>,
        errors: Mutex<Vec<Value>>,
        progress: Mutex<Vec<ProgressRecord>>,
    }

    impl StreamSink for CollectingSink {
        fn output(&self, item: Value) {
            self.output.lock().push(item);
        }
        fn error(&self, item: Value) {
            self.errors.lock().push(item);
        }
        fn progress(&self, record: ProgressRecord) {
            self.progress.lock().push(record);
        }
    }

    fn make_worker() -> LocalWorker {
        let engine = LocalEngine::default();
        let template = WorkerTemplate::new(
            vec!["path".into(), "util".into()],
            HashMap::new(),
            None,
        );
        engine.create_context(&template).unwrap()
    }

    #[tokio::test]
    async fn emit_interpolates_positional_arguments() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        worker
            .run(
                "emit done-$0",
                &[Value::from(50)],
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(sink.output.lock().as_slice(), &[Value::from("done-50")]);
    }

    #[tokio::test]
    async fn variables_persist_across_runs_on_the_same_worker() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        let stop = CancellationToken::new();
        worker.run("incr counter", &[], &sink, &stop).await.unwrap();
        worker.run("get counter", &[], &sink, &stop).await.unwrap();
        worker.run("get counter", &[], &sink, &stop).await.unwrap();
        assert_eq!(
            sink.output.lock().as_slice(),
            &[Value::from(1), Value::from(1)]
        );
    }

    #[tokio::test]
    async fn variable_lookup_is_case_insensitive() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        let stop = CancellationToken::new();
        worker.run("set Marker a", &[], &sink, &stop).await.unwrap();
        worker.run("get MARKER", &[], &sink, &stop).await.unwrap();
        assert_eq!(sink.output.lock().as_slice(), &[Value::from("a")]);
    }

    #[tokio::test]
    async fn unknown_statement_is_rejected_before_side_effects() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        let err = worker
            .run("emit early\nfrobnicate", &[], &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert!(sink.output.lock().is_empty(), "nothing may run");
    }

    #[tokio::test]
    async fn sleep_honors_the_stop_token() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        let stop = CancellationToken::new();
        stop.cancel();
        let err = worker
            .run("sleep 60000; emit late", &[], &sink, &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Interrupted));
        assert!(sink.output.lock().is_empty());
    }

    #[tokio::test]
    async fn fail_carries_the_interpolated_reason() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        let err = worker
            .run(
                "fail broke on $0",
                &[Value::from("disk")],
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            EngineError::Script(reason) => assert_eq!(reason, "broke on disk"),
            other => panic!("expected Script, got {other}"),
        }
    }

    #[tokio::test]
    async fn progress_records_flow_through_the_sink() {
        let mut worker = make_worker();
        let sink = CollectingSink::default();
        worker
            .run(
                "progress 0 starting; progress 50 halfway; progress 100 done",
                &[],
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let records = sink.progress.lock();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].percent_complete, Some(100));
        assert_eq!(records[2].activity, "done");
    }
}
