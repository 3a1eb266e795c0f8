//! Shared output formatting for vc CLI commands.

use serde::Serialize;

use crate::error::{Error, JsonError, Result};

pub const SCHEMA_VERSION: &str = "vc.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Emit a command result either as a JSON envelope or as plain lines.
pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    lines: &[String],
) -> Result<()> {
    if options.json {
        #[derive(Serialize)]
        struct Envelope<'a, T: Serialize> {
            schema_version: &'static str,
            command: &'a str,
            status: &'static str,
            data: &'a T,
        }
        let payload = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "success",
            data,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if options.quiet {
        return Ok(());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

/// Print an error to stderr, honoring the JSON flag.
pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    if json {
        #[derive(Serialize)]
        struct Envelope<'a> {
            schema_version: &'static str,
            command: &'a str,
            status: &'static str,
            error: JsonError,
        }
        let payload = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "error",
            error: JsonError::from(err),
        };
        eprintln!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        eprintln!("error: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_suppresses_plain_output() {
        let options = OutputOptions {
            json: false,
            quiet: true,
        };
        emit_success(options, "status", &(), &["hidden".to_string()]).unwrap();
    }

    #[test]
    fn json_errors_carry_the_exit_code() {
        emit_error("register", &Error::UncommittedChanges, true).unwrap();
    }
}
