//! Session setup shared by the CLI commands.

use std::path::PathBuf;

use callbridge_core::{
    Arg, CallDispatcher, EngineLauncher, ParamType, ProcessLauncher, Returned, Session,
    SessionConfig, Value,
};
use callbridge_engine::{PROBE_DIRECTIVE, in_process_launcher};
use tracing::debug;

use crate::EngineArgs;

/// Resolve the session config: file, then environment, then flags.
pub fn load_config(args: &EngineArgs) -> anyhow::Result<SessionConfig> {
    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                debug!(path = %path.display(), "loading config");
                SessionConfig::load(&path)?
            }
            None => SessionConfig::default(),
        },
    };
    let mut config = config.with_env_overrides()?;

    if args.no_threaded_callbacks {
        config = config.with_threaded_callbacks(false);
    }
    if let Some(bootstrap) = args.bootstrap {
        config = config.with_bootstrap(bootstrap);
    }
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("callbridge").join("config.json"))
}

/// Start a session and register the CLI's host callables.
pub fn open_session(args: &EngineArgs) -> anyhow::Result<Session> {
    let config = load_config(args)?;
    let launcher: Box<dyn EngineLauncher> = if args.in_process {
        Box::new(in_process_launcher())
    } else {
        let launcher = match &args.engine {
            Some(path) => ProcessLauncher::new(path),
            None => ProcessLauncher::discover()?,
        };
        Box::new(launcher.with_probe(PROBE_DIRECTIVE))
    };

    let session = Session::start_boxed(launcher, config)?;
    session.register_callables(console_callables)?;
    Ok(session)
}

/// `type(console)`: lets directives print through the host.
fn console_callables(d: &mut CallDispatcher) {
    d.static_method("console", "print", &[ParamType::Any], |_, args| {
        println!("{}", arg_json(&args[0]));
        Ok(Returned::Nothing)
    })
    .static_method("console", "echo", &[ParamType::Any], |_, args| {
        Ok(match &args[0] {
            Arg::Value(v) => Returned::Value(v.clone()),
            Arg::Object(o) => Returned::Object(o.clone()),
            Arg::Type(name) => Returned::Value(Value::TypeRef(name.clone())),
        })
    });
}

fn arg_json(arg: &Arg) -> serde_json::Value {
    match arg {
        Arg::Value(v) => to_json(v),
        Arg::Object(o) => serde_json::Value::String(format!("<{}>", o.type_name())),
        Arg::Type(name) => serde_json::Value::String(format!("type({})", name)),
    }
}

/// Plain JSON for a wire value. References render as their text form.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(x) => serde_json::Value::from(*x),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        reference => serde_json::Value::String(reference.to_string()),
    }
}

/// One result line: the output list as JSON, or `false` when the directive failed.
pub fn render(outputs: Option<&[Value]>) -> String {
    match outputs {
        Some(values) => {
            serde_json::Value::Array(values.iter().map(to_json).collect()).to_string()
        }
        None => "false".to_string(),
    }
}
