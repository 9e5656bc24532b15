//! Directive evaluation.
//!
//! Goals of a conjunction run left to right against one set of bindings.
//! A goal either succeeds, fails (ending the directive with a logical
//! failure) or raises an [`EngineError`], which becomes the outcome's error
//! term. Calls into the host go through a [`CallPort`].

use std::thread;
use std::time::{Duration, Instant};

use callbridge_core::Value;
use callbridge_core::ipc::{
    ANONYMOUS_VAR, GoalOutcome, GoalRequest, InboundCallOutcome, InboundCallRequest,
};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::term::{Term, parse_directive, parse_term};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// The engine's view of the host while a goal runs.
pub trait CallPort {
    /// Issue an inbound call and wait for its outcome.
    fn call(&mut self, request: InboundCallRequest) -> Result<InboundCallOutcome>;

    /// Whether a break was requested.
    fn interrupted(&self) -> bool;

    /// Goals received so far, the running one included.
    fn goals_served(&self) -> u64;
}

/// Run one goal to its outcome.
///
/// Only channel failures are returned as errors; everything else the
/// directive does ends up in the outcome.
pub fn run_goal(request: &GoalRequest, port: &mut dyn CallPort) -> Result<GoalOutcome> {
    let mut interp = Interpreter::new(port);
    let solved = interp
        .solve(request)
        .and_then(|succeeded| {
            if succeeded {
                interp.outputs(&request.output_spec).map(Some)
            } else {
                Ok(None)
            }
        });

    match solved {
        Ok(Some(outputs)) => Ok(GoalOutcome::success(request.timestamp, outputs)),
        Ok(None) => Ok(GoalOutcome::failure(request.timestamp)),
        Err(e) if e.is_channel() => Err(e),
        Err(e) => {
            debug!(timestamp = request.timestamp, "directive raised: {}", e);
            Ok(GoalOutcome::raised(request.timestamp, e.to_value()))
        }
    }
}

struct Interpreter<'p> {
    port: &'p mut dyn CallPort,
    bindings: FxHashMap<String, Value>,
}

impl<'p> Interpreter<'p> {
    fn new(port: &'p mut dyn CallPort) -> Self {
        Self {
            port,
            bindings: FxHashMap::default(),
        }
    }

    fn solve(&mut self, request: &GoalRequest) -> Result<bool> {
        let goals = parse_directive(&request.directive)?;
        if request.input_var != ANONYMOUS_VAR {
            self.bind(&request.input_var, Value::List(request.inputs.clone()));
        }
        for goal in &goals {
            if self.port.interrupted() {
                return Err(EngineError::Interrupted);
            }
            if !self.step(goal)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Values for the output spec. Unbound variables come back as null.
    fn outputs(&self, spec: &str) -> Result<Vec<Value>> {
        match parse_term(spec)? {
            Term::List(items) => items
                .iter()
                .map(|item| match item {
                    Term::Var(name) => Ok(self.bindings.get(name).cloned().unwrap_or(Value::Null)),
                    other => self.value(other),
                })
                .collect(),
            other => Err(EngineError::Type {
                expected: "output list",
                found: other.to_string(),
            }),
        }
    }

    fn step(&mut self, goal: &Term) -> Result<bool> {
        match goal {
            Term::Atom(name) => match name.as_str() {
                "true" => Ok(true),
                "fail" | "false" => Ok(false),
                "loop" => self.spin(None).map(|_| true),
                _ => Err(EngineError::UnknownDirective(goal.indicator())),
            },
            Term::Compound { name, args } => match (name.as_str(), args.as_slice()) {
                ("=", [left, right]) => self.unify(left, right),
                ("error", [term]) => Err(EngineError::Raised(self.value(term)?)),
                ("sleep", [ms]) => {
                    let ms = self.int(ms)?;
                    let ms = u64::try_from(ms).map_err(|_| EngineError::Type {
                        expected: "non-negative integer",
                        found: ms.to_string(),
                    })?;
                    self.spin(Some(Duration::from_millis(ms))).map(|_| true)
                }
                ("goal_count", [var]) => {
                    let served = Value::Int(self.port.goals_served() as i64);
                    self.unify_value(var, served)
                }
                ("call", [target, method, call_args]) => {
                    self.call_host(target, method, call_args)?;
                    Ok(true)
                }
                ("call", [target, method, call_args, result]) => {
                    let returned = self.call_host(target, method, call_args)?;
                    self.unify_value(result, returned)
                }
                _ => Err(EngineError::UnknownDirective(goal.indicator())),
            },
            other => Err(EngineError::Type {
                expected: "callable",
                found: other.to_string(),
            }),
        }
    }

    /// Wait for `duration`, or forever when `None`, returning early on a break.
    fn spin(&self, duration: Option<Duration>) -> Result<()> {
        let deadline = duration.map(|d| Instant::now() + d);
        loop {
            if self.port.interrupted() {
                return Err(EngineError::Interrupted);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            thread::sleep(pause);
        }
    }

    fn call_host(&mut self, target: &Term, method: &Term, args: &Term) -> Result<Value> {
        let target = self.value(target)?;
        let method = self.name(method)?;
        let arguments = match self.value(args)? {
            Value::List(items) => items,
            other => {
                return Err(EngineError::Type {
                    expected: "argument list",
                    found: other.to_string(),
                });
            }
        };
        debug!(%target, %method, arity = arguments.len(), "calling host");

        let outcome = self
            .port
            .call(InboundCallRequest::new(target, method, arguments))?;
        if let Some(fault) = outcome.exception {
            return Err(EngineError::Host {
                kind: fault.kind,
                message: fault.message,
            });
        }
        Ok(outcome.result.unwrap_or(Value::Null))
    }

    fn bind(&mut self, var: &str, value: Value) {
        if var != ANONYMOUS_VAR {
            self.bindings.insert(var.to_string(), value);
        }
    }

    fn unbound<'t>(&self, term: &'t Term) -> Option<&'t str> {
        match term {
            Term::Var(name) if !self.bindings.contains_key(name) => Some(name),
            _ => None,
        }
    }

    fn unify(&mut self, left: &Term, right: &Term) -> Result<bool> {
        match (self.unbound(left), self.unbound(right)) {
            (Some(_), Some(r)) => Err(EngineError::Unbound(r.to_string())),
            (None, Some(_)) => self.unify(right, left),
            (Some(_), None) => {
                let value = self.value(right)?;
                self.unify_value(left, value)
            }
            (None, None) => match (left, right) {
                (Term::List(ls), Term::List(rs)) => {
                    if ls.len() != rs.len() {
                        return Ok(false);
                    }
                    for (l, r) in ls.iter().zip(rs) {
                        if !self.unify(l, r)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                (_, Term::List(_)) => {
                    let value = self.value(left)?;
                    self.unify_value(right, value)
                }
                _ => {
                    let value = self.value(right)?;
                    self.unify_value(left, value)
                }
            },
        }
    }

    fn unify_value(&mut self, term: &Term, value: Value) -> Result<bool> {
        if let Some(var) = self.unbound(term) {
            self.bind(var, value);
            return Ok(true);
        }
        match (term, value) {
            (Term::List(items), Value::List(values)) => {
                if items.len() != values.len() {
                    return Ok(false);
                }
                for (item, value) in items.iter().zip(values) {
                    if !self.unify_value(item, value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (term, value) => Ok(self.value(term)? == value),
        }
    }

    fn value(&self, term: &Term) -> Result<Value> {
        Ok(match term {
            Term::Var(name) => self
                .bindings
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::Unbound(name.clone()))?,
            Term::Atom(name) => match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => Value::Str(name.clone()),
            },
            Term::Int(i) => Value::Int(*i),
            Term::Float(x) => Value::Float(*x),
            Term::Str(s) => Value::Str(s.clone()),
            Term::Handle(h) => Value::Handle(*h),
            Term::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<_>>()?,
            ),
            Term::Compound { name, args } => match (name.as_str(), args.as_slice()) {
                ("type", [type_name]) => Value::TypeRef(self.name(type_name)?),
                ("static", [type_name, field]) => Value::StaticField {
                    type_name: self.name(type_name)?,
                    field: self.name(field)?,
                },
                _ => {
                    return Err(EngineError::Type {
                        expected: "value",
                        found: term.to_string(),
                    });
                }
            },
        })
    }

    /// An atom or string used as a name.
    fn name(&self, term: &Term) -> Result<String> {
        match term {
            Term::Atom(name) | Term::Str(name) => Ok(name.clone()),
            Term::Var(_) => match self.value(term)? {
                Value::Str(name) => Ok(name),
                other => Err(EngineError::Type {
                    expected: "name",
                    found: other.to_string(),
                }),
            },
            other => Err(EngineError::Type {
                expected: "name",
                found: other.to_string(),
            }),
        }
    }

    fn int(&self, term: &Term) -> Result<i64> {
        match self.value(term)? {
            Value::Int(i) => Ok(i),
            other => Err(EngineError::Type {
                expected: "integer",
                found: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::Fault;

    /// Answers every call from a canned list and records the requests.
    #[derive(Default)]
    struct FakePort {
        answers: Vec<InboundCallOutcome>,
        calls: Vec<InboundCallRequest>,
        interrupted: bool,
    }

    impl CallPort for FakePort {
        fn call(&mut self, request: InboundCallRequest) -> Result<InboundCallOutcome> {
            self.calls.push(request);
            if self.answers.is_empty() {
                return Err(EngineError::Channel(callbridge_core::Error::Transport(
                    "channel closed".into(),
                )));
            }
            Ok(self.answers.remove(0))
        }

        fn interrupted(&self) -> bool {
            self.interrupted
        }

        fn goals_served(&self) -> u64 {
            4
        }
    }

    fn goal(directive: &str, outputs: &str) -> GoalRequest {
        GoalRequest {
            timestamp: 1,
            directive: directive.to_string(),
            input_var: ANONYMOUS_VAR.to_string(),
            inputs: vec![],
            output_spec: outputs.to_string(),
        }
    }

    fn run(directive: &str, outputs: &str) -> GoalOutcome {
        run_goal(&goal(directive, outputs), &mut FakePort::default()).unwrap()
    }

    #[test]
    fn test_bindings_become_outputs() {
        let outcome = run("X = 1, Y = 2", "[X, Y]");
        assert!(outcome.succeeded);
        assert_eq!(outcome.outputs, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_unbound_outputs_are_null() {
        let outcome = run("true", "[X, 3]");
        assert_eq!(outcome.outputs, vec![Value::Null, Value::Int(3)]);
    }

    #[test]
    fn test_fail_and_mismatch_are_logical_failures() {
        assert!(!run("fail", "[]").succeeded);
        let outcome = run("X = 1, X = 2", "[X]");
        assert!(!outcome.succeeded);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_list_unification() {
        let outcome = run("[A, B] = [1, \"two\"]", "[A, B]");
        assert_eq!(outcome.outputs, vec![Value::Int(1), Value::from("two")]);

        let outcome = run("L = [1, 2], [A, B] = L", "[A, B]");
        assert_eq!(outcome.outputs, vec![Value::Int(1), Value::Int(2)]);

        assert!(!run("[A] = [1, 2]", "[]").succeeded);
    }

    #[test]
    fn test_inputs_are_bound_as_list() {
        let mut request = goal("L = [A, B]", "[B]");
        request.input_var = "L".into();
        request.inputs = vec![Value::from("a"), Value::from("b")];
        let outcome = run_goal(&request, &mut FakePort::default()).unwrap();
        assert_eq!(outcome.outputs, vec![Value::from("b")]);
    }

    #[test]
    fn test_errors_become_error_terms() {
        let raised = run("error(\"boom\")", "[]");
        assert_eq!(raised.error, Some(Value::from("boom")));

        let unknown = run("frobnicate(1)", "[]");
        assert_eq!(
            unknown.error,
            Some(Value::from("existence_error(directive, frobnicate/1)"))
        );

        let unbound = run("X = Y", "[]");
        assert_eq!(unbound.error, Some(Value::from("instantiation_error(Y)")));

        let syntax = run("X = = 1", "[]");
        assert!(syntax.error.unwrap().as_str().unwrap().starts_with("syntax_error("));
    }

    #[test]
    fn test_call_issues_inbound_request() {
        let mut port = FakePort {
            answers: vec![InboundCallOutcome::returned(Some(Value::Handle(3)))],
            ..FakePort::default()
        };
        let outcome = run_goal(
            &goal("call(type(demo.Counter), \"Counter\", [1, @2], R)", "[R]"),
            &mut port,
        )
        .unwrap();
        assert_eq!(outcome.outputs, vec![Value::Handle(3)]);
        assert_eq!(
            port.calls[0],
            InboundCallRequest::new(
                Value::TypeRef("demo.Counter".into()),
                "Counter",
                vec![Value::Int(1), Value::Handle(2)]
            )
        );
    }

    #[test]
    fn test_static_field_target() {
        let mut port = FakePort {
            answers: vec![InboundCallOutcome::returned(None)],
            ..FakePort::default()
        };
        let outcome = run_goal(&goal("call(static(demo.Counter, limit), add, [1])", "[]"), &mut port)
            .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(
            port.calls[0].target,
            Value::StaticField {
                type_name: "demo.Counter".into(),
                field: "limit".into()
            }
        );
    }

    #[test]
    fn test_host_fault_is_raised() {
        let mut port = FakePort {
            answers: vec![InboundCallOutcome::faulted(Fault::new("no_such_method", "nope"))],
            ..FakePort::default()
        };
        let outcome = run_goal(&goal("call(@1, m, [])", "[]"), &mut port).unwrap();
        assert_eq!(
            outcome.error,
            Some(Value::from("host_exception(no_such_method, \"nope\")"))
        );
    }

    #[test]
    fn test_channel_loss_is_returned_as_error() {
        let result = run_goal(&goal("call(@1, m, [])", "[]"), &mut FakePort::default());
        assert!(matches!(result, Err(EngineError::Channel(_))));
    }

    #[test]
    fn test_interrupt_stops_loop() {
        let mut port = FakePort {
            interrupted: true,
            ..FakePort::default()
        };
        let outcome = run_goal(&goal("loop", "[]"), &mut port).unwrap();
        assert_eq!(outcome.error, Some(Value::from("interrupted")));
    }

    #[test]
    fn test_goal_count_and_sleep() {
        let started = Instant::now();
        let outcome = run("sleep(20), goal_count(N)", "[N]");
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(outcome.outputs, vec![Value::Int(4)]);
        assert!(run("sleep(-1)", "[]").error.is_some());
    }
}
