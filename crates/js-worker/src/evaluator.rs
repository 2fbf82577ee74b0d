use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Object, Promise, Runtime, Value};
use sandbox::{ErrorKind, ExecutionRequest, ExecutionResult, LogKind, RuntimeLimits};
use tracing::{debug, warn};

use crate::codec;
use crate::console::ConsoleSink;
use crate::instrument::{self, TRACE_FN};
use crate::timeline::{RunClock, Timeline};

/// How a single run ended, before packaging.
enum Outcome {
    Returned(Option<serde_json::Value>),
    Failed(ErrorKind, String),
}

/// Runs one request at a time against a freshly built QuickJS runtime.
///
/// Nothing survives between runs: the runtime, context, console object and
/// trace hook are created for the run and dropped before `evaluate` returns.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    limits: RuntimeLimits,
}

impl Evaluator {
    pub fn new(limits: RuntimeLimits) -> Self {
        Self { limits }
    }

    /// Run a request and package its outcome. Never fails: user-code errors
    /// are reported through the result's `error` field.
    pub fn evaluate(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self.try_evaluate(request) {
            Ok(result) => result,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "JS runtime setup failed");
                ExecutionResult::failed(
                    request.id.as_str(),
                    ErrorKind::Worker,
                    format!("failed to initialize JS runtime: {e}"),
                    0.0,
                )
            }
        }
    }

    fn new_runtime(&self) -> rquickjs::Result<Runtime> {
        let runtime = Runtime::new()?;
        // 0 means "no limit"
        if self.limits.memory_limit_bytes > 0 {
            runtime.set_memory_limit(self.limits.memory_limit_bytes);
        }
        if self.limits.max_stack_bytes > 0 {
            runtime.set_max_stack_size(self.limits.max_stack_bytes);
        }
        Ok(runtime)
    }

    fn try_evaluate(&self, request: &ExecutionRequest) -> rquickjs::Result<ExecutionResult> {
        let runtime = self.new_runtime()?;
        let context = Context::full(&runtime)?;

        let body = if request.instrument {
            instrument::instrument(&request.code)
        } else {
            request.code.clone()
        };
        let source = wrap_source(&body, request.instrument);

        let clock = RunClock::start();
        let sink = Rc::new(RefCell::new(ConsoleSink::new(clock)));
        let timeline = Rc::new(RefCell::new(Timeline::new(clock)));

        let outcome = context.with(|ctx| {
            let trace = request.instrument.then_some(&timeline);
            run_in_context(&ctx, &source, &sink, trace)
        });
        let duration_ms = clock.elapsed_ms();

        // Tear down the run's JS state before anything is reported.
        drop(context);
        drop(runtime);

        let logs = sink.replace(ConsoleSink::new(clock)).into_entries();
        let timeline = if request.instrument {
            timeline.replace(Timeline::new(clock)).into_events()
        } else {
            None
        };

        let (result, error, error_kind) = match outcome {
            Outcome::Returned(value) => (value, None, None),
            Outcome::Failed(kind, message) => (None, Some(message), Some(kind)),
        };

        debug!(
            request_id = %request.id,
            logs = logs.len(),
            trace_events = timeline.as_ref().map_or(0, Vec::len),
            duration_ms,
            failed = error.is_some(),
            "run finished"
        );

        Ok(ExecutionResult {
            id: request.id.clone(),
            logs,
            result,
            error,
            error_kind,
            duration_ms,
            timeline,
        })
    }
}

/// Wrap the body in an async function whose parameters are the only
/// bindings user code receives. The body starts on the header's line so
/// reported line numbers match the submitted source.
fn wrap_source(body: &str, instrument: bool) -> String {
    let params = if instrument {
        format!("console, {TRACE_FN}")
    } else {
        "console".to_owned()
    };
    format!("(async function ({params}) {{ {body}\n}})")
}

fn console_object<'js>(ctx: &Ctx<'js>, sink: &Rc<RefCell<ConsoleSink>>) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for kind in LogKind::ALL {
        let sink = Rc::clone(sink);
        let method = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let text = codec::format_console_args(&ctx, &args.0);
                sink.borrow_mut().push(kind, text);
            },
        )?;
        console.set(kind.as_str(), method)?;
    }
    Ok(console)
}

fn trace_hook<'js>(ctx: &Ctx<'js>, timeline: &Rc<RefCell<Timeline>>) -> rquickjs::Result<Function<'js>> {
    let timeline = Rc::clone(timeline);
    Function::new(ctx.clone(), move |line: u32, snippet: String| {
        timeline.borrow_mut().record(line, snippet);
    })
}

fn failed<'js>(ctx: &Ctx<'js>, kind: ErrorKind, caught: CaughtError<'js>) -> Outcome {
    if let CaughtError::Error(rquickjs::Error::WouldBlock) = caught {
        return Outcome::Failed(
            kind,
            "execution never settled: awaited a promise that cannot resolve".to_owned(),
        );
    }
    Outcome::Failed(kind, codec::describe_caught(ctx, caught))
}

fn run_in_context<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    sink: &Rc<RefCell<ConsoleSink>>,
    timeline: Option<&Rc<RefCell<Timeline>>>,
) -> Outcome {
    let function = match ctx.eval::<Function<'js>, _>(source).catch(ctx) {
        Ok(function) => function,
        Err(caught) => return failed(ctx, ErrorKind::Syntax, caught),
    };

    let console = match console_object(ctx, sink).catch(ctx) {
        Ok(console) => console,
        Err(caught) => return failed(ctx, ErrorKind::Runtime, caught),
    };

    let call = match timeline {
        Some(timeline) => match trace_hook(ctx, timeline).catch(ctx) {
            Ok(trace) => function.call::<_, Promise<'js>>((console, trace)),
            Err(caught) => return failed(ctx, ErrorKind::Runtime, caught),
        },
        None => function.call::<_, Promise<'js>>((console,)),
    };

    let settled = call
        .and_then(|promise| promise.finish::<Value<'js>>())
        .catch(ctx);
    match settled {
        Ok(value) => Outcome::Returned(codec::to_transport(ctx, value)),
        Err(caught) => failed(ctx, ErrorKind::Runtime, caught),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(code: &str, instrument: bool) -> ExecutionResult {
        let request = ExecutionRequest::new("test", code).with_instrument(instrument);
        Evaluator::default().evaluate(&request)
    }

    #[test]
    fn console_log_is_captured() {
        let result = run("console.log(1+1)", false);
        assert_eq!(result.id, "test");
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].kind, LogKind::Log);
        assert_eq!(result.logs[0].text, "2");
        assert!(result.result.is_none());
        assert!(result.error.is_none());
        assert!(result.timeline.is_none());
        assert!(result.duration_ms >= 0.0);
    }

    #[test]
    fn string_arguments_round_trip() {
        let result = run(r#"console.log("x")"#, false);
        assert_eq!(result.logs[0].text, "x");
    }

    #[test]
    fn every_console_method_has_its_kind() {
        let result = run(
            "console.log('a'); console.warn('b'); console.error('c'); console.info('d');",
            false,
        );
        let kinds: Vec<LogKind> = result.logs.iter().map(|l| l.kind).collect();
        assert_eq!(kinds, LogKind::ALL.to_vec());
        assert!(result.logs.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }

    #[test]
    fn thrown_error_is_reported() {
        let result = run("throw new Error('boom')", false);
        assert!(result.error.as_deref().unwrap().contains("boom"));
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert!(result.logs.is_empty());
    }

    #[test]
    fn logs_before_failure_are_kept() {
        let result = run("console.log('before');\nnull.x;\nconsole.log('after');", false);
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].text, "before");
        assert!(result.error.as_deref().unwrap().starts_with("TypeError"));
    }

    #[test]
    fn async_rejection_is_reported() {
        let result = run(
            "await Promise.resolve();\nconsole.log('tick');\nawait Promise.reject(new Error('later'));",
            false,
        );
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.error.as_deref(), Some("Error: later"));
    }

    #[test]
    fn syntax_error_is_classified() {
        let result = run("let = ;", false);
        assert_eq!(result.error_kind, Some(ErrorKind::Syntax));
        assert!(result.error.as_deref().unwrap().contains("SyntaxError"));
        assert!(result.logs.is_empty());
    }

    #[test]
    fn returned_value_becomes_result() {
        let result = run("const xs = [1, 2, 3];\nreturn { sum: xs.reduce((a, b) => a + b, 0) };", false);
        assert_eq!(result.result, Some(json!({"sum": 6})));
    }

    #[test]
    fn unsettled_promise_is_a_runtime_error() {
        let result = run("await new Promise(() => {});", false);
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert!(result.error.as_deref().unwrap().contains("never settled"));
    }

    #[test]
    fn instrumented_run_records_each_line() {
        let result = run("let x=5;\nlet y=x*2;\nconsole.log(y);", true);
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].text, "10");
        let timeline = result.timeline.unwrap();
        let lines: Vec<u32> = timeline.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert_eq!(timeline[1].snippet, "let y=x*2;");
        assert!(timeline.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }

    #[test]
    fn loop_bodies_are_traced_per_iteration() {
        let result = run("for (let i = 0; i < 3; i++) {\n  console.log(i);\n}", true);
        let lines: Vec<u32> = result.timeline.unwrap().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2, 2, 2]);
    }

    #[test]
    fn timeline_stops_at_failure_point() {
        let result = run("let a = 1;\nthrow new Error('stop');\nlet b = 2;", true);
        let lines: Vec<u32> = result.timeline.unwrap().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2]);
        assert!(result.error.unwrap().contains("stop"));
    }

    #[test]
    fn no_timeline_without_reached_statements() {
        let result = run("// nothing here\n", true);
        assert!(result.timeline.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn trace_hook_is_not_visible_without_instrumentation() {
        let result = run(&format!("return typeof {TRACE_FN};"), false);
        assert_eq!(result.result, Some(json!("undefined")));
    }

    #[test]
    fn runs_do_not_share_globals() {
        let evaluator = Evaluator::default();
        let first = evaluator.evaluate(&ExecutionRequest::new("a", "globalThis.leak = 1;"));
        assert!(first.error.is_none());
        let second = evaluator.evaluate(&ExecutionRequest::new("b", "return typeof globalThis.leak;"));
        assert_eq!(second.result, Some(json!("undefined")));
    }

    #[test]
    fn deterministic_code_gives_identical_output() {
        let code = "const o = {a: 1, b: [2, 3]};\nconsole.log(o);\nreturn o.b.length;";
        let first = run(code, false);
        let second = run(code, false);
        let texts = |r: &ExecutionResult| r.logs.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(texts(&first), texts(&second));
        assert_eq!(first.result, second.result);
    }

    #[test]
    fn line_numbers_in_errors_match_source() {
        let result = run("let a = 1;\n\nundefinedFn();", false);
        assert!(result.error.unwrap().contains("undefinedFn"));
    }

    #[test]
    fn memory_limit_failure_is_contained() {
        let evaluator = Evaluator::new(RuntimeLimits {
            memory_limit_bytes: 8 * 1024 * 1024,
            ..RuntimeLimits::default()
        });
        let request = ExecutionRequest::new(
            "oom",
            "const parts = [];\nwhile (true) { parts.push('x'.repeat(1 << 16)); }",
        );
        let result = evaluator.evaluate(&request);
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert!(result.error.is_some());
    }
}
