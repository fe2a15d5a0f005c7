//! Subprocess execution for the switch and host tools.

use std::ffi::OsStr;
use std::path::Path;

use dovesnap_common::{DovesnapError, DovesnapResult};
use tokio::process::Command;

/// A command that exited non-zero or could not be started.
#[derive(Debug)]
pub(crate) struct Failed {
    pub command: String,
    pub output: String,
}

impl Failed {
    pub(crate) fn into_switch(self) -> DovesnapError {
        DovesnapError::Switch {
            command: self.command,
            output: self.output,
        }
    }

    pub(crate) fn into_host(self) -> DovesnapError {
        DovesnapError::Host {
            message: format!("{}: {}", self.command, self.output),
        }
    }
}

fn render<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run `program` to completion and return its combined output with the
/// trailing newline removed.
pub(crate) async fn run<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> Result<String, Failed> {
    let command = render(program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Failed {
            command: command.clone(),
            output: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim_end_matches('\n').to_string();

    if output.status.success() {
        tracing::debug!(%command, "OK");
        Ok(combined)
    } else {
        tracing::debug!(%command, output = %combined, "FAILED");
        Err(Failed {
            command,
            output: combined,
        })
    }
}

/// Run a host tool (`ip`, `iptables`) found on `PATH`.
pub(crate) async fn run_host<S: AsRef<OsStr>>(program: &str, args: &[S]) -> DovesnapResult<String> {
    run(Path::new(program), args).await.map_err(Failed::into_host)
}
