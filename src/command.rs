//! Running external host tools, with logging

use crate::errors::Error;
use std::{ffi::OsStr, process::Command};

fn describe<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run a command to completion and return its stdout
///
/// A nonzero exit is reported as [Error::Command] along with whatever the
/// command printed to stderr.
pub fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String, Error> {
    let line = describe(program, args);
    log::info!("+ {}", line);
    quiet(program, args).map_err(|err| {
        if let Error::Command { stderr, .. } = &err {
            log::debug!("{}", stderr.trim_end());
        }
        err
    })
}

/// Like [run], without logging the command line
pub fn quiet<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String, Error> {
    let output = Command::new(program).args(args).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !stdout.is_empty() {
        log::debug!("{}: {}", program, stdout.trim_end());
    }
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(Error::Command {
            command: describe(program, args),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run("echo", &["hello", "world"]).unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn reports_failure() {
        match run("sh", &["-c", "echo oops >&2; exit 3"]) {
            Err(Error::Command { status, stderr, .. }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "oops\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
