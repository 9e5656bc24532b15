//! Shell command implementation: a line-oriented prompt over one session.
//!
//! Each line is `directive` or `directive => [Vars]`. Blank lines and lines
//! starting with `%` are skipped; `halt` ends the session.

use std::io::{self, BufRead, IsTerminal, Write};

use callbridge_core::Goal;

use crate::EngineArgs;
use crate::engine::{open_session, render};

const PROMPT: &str = "?- ";

/// Execute the shell.
pub fn execute(args: &EngineArgs) -> anyhow::Result<()> {
    let session = open_session(args)?;
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();

    let mut lines = stdin.lock().lines();
    loop {
        if interactive {
            eprint!("{}", PROMPT);
            io::stderr().flush()?;
        }
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let Some(entry) = parse_line(&line) else {
            continue;
        };
        if entry.directive == "halt" {
            break;
        }

        let goal = match entry.outputs {
            Some(spec) => Goal::new(entry.directive).outputs(spec),
            None => Goal::new(entry.directive),
        };
        match session.submit_goal(goal) {
            Ok(answer) if entry.outputs.is_none() => {
                println!("{}", if answer.is_some() { "true" } else { "false" })
            }
            Ok(answer) => println!("{}", render(answer.as_deref())),
            Err(e) if e.is_fatal() => {
                session.shutdown()?;
                return Err(e.into());
            }
            Err(e) => eprintln!("error: {}", e.with_hint()),
        }
    }

    session.shutdown()?;
    Ok(())
}

#[derive(Debug, PartialEq)]
struct Entry<'a> {
    directive: &'a str,
    outputs: Option<&'a str>,
}

fn parse_line(line: &str) -> Option<Entry<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('%') {
        return None;
    }
    let (directive, outputs) = match line.split_once("=>") {
        Some((directive, outputs)) => (directive, Some(outputs.trim())),
        None => (line, None),
    };
    // Accept a terminating '.' out of habit.
    let directive = directive.trim().trim_end_matches('.').trim_end();
    Some(Entry { directive, outputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("X = 1, Y = 2 => [X, Y]"),
            Some(Entry {
                directive: "X = 1, Y = 2",
                outputs: Some("[X, Y]")
            })
        );
        assert_eq!(
            parse_line("  true.  "),
            Some(Entry {
                directive: "true",
                outputs: None
            })
        );
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("% comment"), None);
    }
}
