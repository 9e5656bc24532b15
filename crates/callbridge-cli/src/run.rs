//! Run command implementation.
//!
//! Submits each directive in order on one session and prints one line per
//! directive: the outputs as JSON, `true`, or `false`.

use callbridge_core::Goal;
use tracing::info;

use crate::EngineArgs;
use crate::engine::{open_session, render};

/// Execute directives.
pub fn execute(directives: &[String], outputs: Option<&str>, args: &EngineArgs) -> anyhow::Result<()> {
    let session = open_session(args)?;
    info!(session = %session.session_id(), directives = directives.len(), "running directives");

    let result = directives.iter().try_for_each(|directive| {
        let mut goal = Goal::new(directive.as_str());
        if let Some(spec) = outputs {
            goal = goal.outputs(spec);
        }
        let answer = session.submit_goal(goal)?;
        match (outputs, answer) {
            (None, Some(_)) => println!("true"),
            (_, answer) => println!("{}", render(answer.as_deref())),
        }
        Ok::<_, callbridge_core::Error>(())
    });

    session.shutdown()?;
    result?;
    Ok(())
}
