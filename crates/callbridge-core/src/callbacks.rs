//! Host callables invoked by the engine.
//!
//! The engine addresses host code by `{target, method, arguments}`. A
//! [`CallDispatcher`] maps `{target kind, name, arity}` to registered
//! closures, choosing among overloads by parameter type: exact matches win,
//! otherwise the first overload whose parameters accept the arguments after
//! widening.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::ipc::{Fault, InboundCallOutcome, InboundCallRequest};
use crate::registry::{HostObject, object_type_id};
use crate::session::Session;
use crate::value::Value;

/// An argument after handle and type references were resolved.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Object(Arc<dyn HostObject>),
    Type(String),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    /// Borrow the argument as a host object of type `T`.
    pub fn object<T: HostObject>(&self) -> Option<&T> {
        match self {
            Arg::Object(o) => o.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn object_arc(&self) -> Option<Arc<dyn HostObject>> {
        match self {
            Arg::Object(o) => Some(Arc::clone(o)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Arg::Value(v) => v.kind().to_string(),
            Arg::Object(o) => o.type_name().to_string(),
            Arg::Type(name) => format!("type({})", name),
        }
    }
}

/// What a host callable hands back to the engine.
#[derive(Debug, Clone)]
pub enum Returned {
    /// No result (the engine sees an absent value).
    Nothing,
    Value(Value),
    /// An object; registered and sent as a handle.
    Object(Arc<dyn HostObject>),
}

impl Returned {
    pub fn object<T: HostObject>(object: T) -> Self {
        Returned::Object(Arc::new(object))
    }
}

impl From<Value> for Returned {
    fn from(v: Value) -> Self {
        Returned::Value(v)
    }
}

macro_rules! returned_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Returned {
            fn from(v: $t) -> Self {
                Returned::Value(Value::from(v))
            }
        })*
    };
}

returned_from!(bool, i64, i32, f64, &str, String);

/// Declared type of a callable parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// Accepts anything, but never counts as an exact match.
    Any,
    Bool,
    Int,
    Float,
    Str,
    List,
    /// A type reference (`type(Name)` on the engine side).
    Type,
    /// A registered host object of one concrete type.
    Object(TypeId),
}

impl ParamType {
    pub fn object<T: HostObject>() -> Self {
        ParamType::Object(TypeId::of::<T>())
    }

    fn is_primitive(&self) -> bool {
        matches!(self, ParamType::Bool | ParamType::Int | ParamType::Float)
    }

    fn exact(&self, arg: &Arg) -> bool {
        match (self, arg) {
            (ParamType::Bool, Arg::Value(Value::Bool(_)))
            | (ParamType::Int, Arg::Value(Value::Int(_)))
            | (ParamType::Float, Arg::Value(Value::Float(_)))
            | (ParamType::Str, Arg::Value(Value::Str(_)))
            | (ParamType::List, Arg::Value(Value::List(_)))
            | (ParamType::Type, Arg::Type(_)) => true,
            (ParamType::Object(id), Arg::Object(o)) => object_type_id(o.as_ref()) == *id,
            _ => false,
        }
    }

    fn accepts(&self, arg: &Arg) -> bool {
        if self.exact(arg) || *self == ParamType::Any {
            return true;
        }
        match (self, arg) {
            (ParamType::Float, Arg::Value(Value::Int(_))) => true,
            (param, Arg::Value(Value::Null)) => !param.is_primitive(),
            _ => false,
        }
    }
}

/// Outcome of a host callable.
pub type CallResult = std::result::Result<Returned, Fault>;

type Invocable = Arc<dyn Fn(&Session, Option<&Arg>, &[Arg]) -> CallResult + Send + Sync>;
type FieldReader = Arc<dyn Fn(&Session) -> CallResult + Send + Sync>;

#[derive(Clone)]
struct Callable {
    params: Vec<ParamType>,
    invoke: Invocable,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TargetKind {
    Instance(TypeId),
    Type(String),
    Literal(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey {
    target: TargetKind,
    name: String,
    arity: usize,
}

/// A call target after resolution.
#[derive(Debug, Clone)]
pub enum Target {
    Object(Arc<dyn HostObject>),
    Type(String),
    Literal(Value),
}

impl Target {
    fn kind(&self) -> TargetKind {
        match self {
            Target::Object(o) => TargetKind::Instance(object_type_id(o.as_ref())),
            Target::Type(name) => TargetKind::Type(name.clone()),
            Target::Literal(v) => TargetKind::Literal(v.kind()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Target::Object(o) => o.type_name().to_string(),
            Target::Type(name) => format!("type {}", name),
            Target::Literal(v) => format!("{} literal", v.kind()),
        }
    }
}

/// Last segment of a type name: `geo::Point` and `geo.Point` are both `Point`.
pub fn short_type_name(type_name: &str) -> &str {
    type_name
        .rsplit(['.', ':'])
        .next()
        .unwrap_or(type_name)
}

/// Registry of host callables.
#[derive(Default)]
pub struct CallDispatcher {
    callables: FxHashMap<CallKey, Vec<Callable>>,
    fields: FxHashMap<(String, String), FieldReader>,
    types: FxHashSet<String>,
}

impl CallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, target: TargetKind, name: &str, params: &[ParamType], invoke: Invocable) {
        let key = CallKey {
            target,
            name: name.to_string(),
            arity: params.len(),
        };
        debug!(?key, "registered host callable");
        self.callables.entry(key).or_default().push(Callable {
            params: params.to_vec(),
            invoke,
        });
    }

    /// Register a method on objects of type `T`.
    pub fn method<T, F>(&mut self, name: &str, params: &[ParamType], f: F) -> &mut Self
    where
        T: HostObject,
        F: Fn(&T, &Session, &[Arg]) -> CallResult + Send + Sync + 'static,
    {
        let invoke: Invocable = Arc::new(
            move |session: &Session, receiver: Option<&Arg>, args: &[Arg]| {
                let receiver = receiver
                    .and_then(|r| r.object::<T>())
                    .ok_or_else(|| Fault::new("host_error", "receiver has the wrong type"))?;
                f(receiver, session, args)
            },
        );
        self.add(TargetKind::Instance(TypeId::of::<T>()), name, params, invoke);
        self
    }

    /// Register a static method reachable through `type(type_name)`.
    pub fn static_method<F>(
        &mut self,
        type_name: &str,
        name: &str,
        params: &[ParamType],
        f: F,
    ) -> &mut Self
    where
        F: Fn(&Session, &[Arg]) -> CallResult + Send + Sync + 'static,
    {
        self.types.insert(type_name.to_string());
        let invoke: Invocable =
            Arc::new(move |session: &Session, _: Option<&Arg>, args: &[Arg]| f(session, args));
        self.add(TargetKind::Type(type_name.to_string()), name, params, invoke);
        self
    }

    /// Register a constructor: a static method named after the type itself.
    pub fn constructor<F>(&mut self, type_name: &str, params: &[ParamType], f: F) -> &mut Self
    where
        F: Fn(&Session, &[Arg]) -> CallResult + Send + Sync + 'static,
    {
        let name = short_type_name(type_name).to_string();
        self.static_method(type_name, &name, params, f)
    }

    /// Register a readable static field.
    pub fn static_field<F>(&mut self, type_name: &str, field: &str, f: F) -> &mut Self
    where
        F: Fn(&Session) -> CallResult + Send + Sync + 'static,
    {
        self.types.insert(type_name.to_string());
        self.fields
            .insert((type_name.to_string(), field.to_string()), Arc::new(f));
        self
    }

    /// Register a method on literal values of one kind (see [`Value::kind`]).
    pub fn literal_method<F>(
        &mut self,
        kind: &'static str,
        name: &str,
        params: &[ParamType],
        f: F,
    ) -> &mut Self
    where
        F: Fn(&Value, &Session, &[Arg]) -> CallResult + Send + Sync + 'static,
    {
        let invoke: Invocable = Arc::new(
            move |session: &Session, receiver: Option<&Arg>, args: &[Arg]| match receiver {
                Some(Arg::Value(v)) => f(v, session, args),
                _ => Err(Fault::new("host_error", "receiver is not a literal")),
            },
        );
        self.add(TargetKind::Literal(kind), name, params, invoke);
        self
    }

    pub fn knows_type(&self, type_name: &str) -> bool {
        self.types.contains(type_name)
    }

    fn field(&self, type_name: &str, field: &str) -> Option<FieldReader> {
        self.fields
            .get(&(type_name.to_string(), field.to_string()))
            .cloned()
    }

    /// Pick the overload for `name` on `target`: exact match first, then widening.
    fn select(&self, target: &Target, name: &str, args: &[Arg]) -> Option<Callable> {
        let key = CallKey {
            target: target.kind(),
            name: name.to_string(),
            arity: args.len(),
        };
        let candidates = self.callables.get(&key)?;
        let all = |c: &&Callable, pred: fn(&ParamType, &Arg) -> bool| {
            c.params.iter().zip(args).all(|(p, a)| pred(p, a))
        };
        candidates
            .iter()
            .find(|c| all(c, ParamType::exact))
            .or_else(|| candidates.iter().find(|c| all(c, ParamType::accepts)))
            .cloned()
    }

    /// Number of registered overloads.
    pub fn len(&self) -> usize {
        self.callables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

impl fmt::Debug for CallDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDispatcher")
            .field("callables", &self.len())
            .field("fields", &self.fields.len())
            .field("types", &self.types)
            .finish()
    }
}

/// Execute one inbound call against `session`. Never fails: faults are
/// returned to the engine inside the outcome.
pub(crate) fn execute(session: &Session, request: &InboundCallRequest) -> InboundCallOutcome {
    let mut outcome = match invoke(session, request) {
        Ok(result) => InboundCallOutcome::returned(result),
        Err(fault) => {
            warn!(
                method = %request.method,
                target = %request.target,
                "inbound call failed: {}",
                fault
            );
            InboundCallOutcome::faulted(fault)
        }
    };
    if request.echo_arguments {
        outcome.echoed_arguments = Some(request.arguments.clone());
    }
    outcome
}

fn invoke(session: &Session, request: &InboundCallRequest) -> std::result::Result<Option<Value>, Fault> {
    let target = resolve_target(session, &request.target)?;
    let args = request
        .arguments
        .iter()
        .map(|a| resolve_arg(session, a))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let callable = session
        .with_dispatcher(|d| d.select(&target, &request.method, &args))
        .map_err(Fault::from)?
        .ok_or_else(|| {
            let kinds: Vec<_> = args.iter().map(Arg::describe).collect();
            Fault::new(
                "no_such_method",
                format!(
                    "no method {}/{} on {} accepting ({})",
                    request.method,
                    args.len(),
                    target.describe(),
                    kinds.join(", ")
                ),
            )
        })?;

    let receiver = match &target {
        Target::Object(o) => Some(Arg::Object(Arc::clone(o))),
        Target::Literal(v) => Some(Arg::Value(v.clone())),
        Target::Type(_) => None,
    };
    debug!(method = %request.method, target = %target.describe(), "invoking host callable");
    let returned = (callable.invoke)(session, receiver.as_ref(), &args)?;
    to_wire(session, returned)
}

fn resolve_target(session: &Session, target: &Value) -> std::result::Result<Target, Fault> {
    match target {
        Value::Handle(h) => Ok(Target::Object(session.resolve_handle(*h)?)),
        Value::TypeRef(name) => {
            let known = session
                .with_dispatcher(|d| d.knows_type(name))
                .map_err(Fault::from)?;
            if known {
                Ok(Target::Type(name.clone()))
            } else {
                Err(Fault::new("unknown_type", format!("unknown type {}", name)))
            }
        }
        Value::StaticField { type_name, field } => match read_field(session, type_name, field)? {
            Returned::Object(o) => Ok(Target::Object(o)),
            Returned::Value(v) => Ok(Target::Literal(v)),
            Returned::Nothing => Ok(Target::Literal(Value::Null)),
        },
        literal => Ok(Target::Literal(literal.clone())),
    }
}

fn resolve_arg(session: &Session, arg: &Value) -> std::result::Result<Arg, Fault> {
    match arg {
        Value::Handle(h) => Ok(Arg::Object(session.resolve_handle(*h)?)),
        Value::TypeRef(name) => Ok(Arg::Type(name.clone())),
        Value::StaticField { type_name, field } => match read_field(session, type_name, field)? {
            Returned::Object(o) => Ok(Arg::Object(o)),
            Returned::Value(v) => Ok(Arg::Value(v)),
            Returned::Nothing => Ok(Arg::Value(Value::Null)),
        },
        other => Ok(Arg::Value(other.clone())),
    }
}

fn read_field(session: &Session, type_name: &str, field: &str) -> std::result::Result<Returned, Fault> {
    let reader = session
        .with_dispatcher(|d| d.field(type_name, field))
        .map_err(Fault::from)?
        .ok_or_else(|| {
            Fault::new(
                "unknown_field",
                format!("no static field {} on {}", field, type_name),
            )
        })?;
    reader(session)
}

fn to_wire(session: &Session, returned: Returned) -> std::result::Result<Option<Value>, Fault> {
    match returned {
        Returned::Nothing => Ok(None),
        Returned::Value(v) => Ok(Some(v)),
        Returned::Object(o) => Ok(Some(Value::Handle(session.register_object(o)?))),
    }
}
