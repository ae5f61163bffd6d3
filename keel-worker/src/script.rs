//! Tera rendering of the worker startup script.
//!
//! The template is embedded at compile time. It polls the command slot once
//! per second and runs the project's build steps in order on `BUILD`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use tera::{Context, Tera, Value};

use crate::channel::{ChannelLayout, WORKER_STAGING_EXT};
use crate::error::{io_err, WorkerError};
use crate::process::WorkerSpec;

const WORKER_TEMPLATE_NAME: &str = "worker.sh";
const WORKER_TEMPLATE: &str = include_str!("templates/worker.sh.tera");

/// Seconds between command slot reads inside the worker.
const WORKER_POLL_SECS: u64 = 1;

#[derive(Debug, Serialize)]
struct StepContext {
    name: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct ScriptContext {
    project: String,
    working_dir: String,
    command_file: String,
    status_file: String,
    steps: Vec<StepContext>,
    hold_secs: u64,
    poll_secs: u64,
    staging_ext: &'static str,
}

/// Renders worker scripts from the embedded template.
pub struct ScriptRenderer {
    tera: Tera,
}

impl ScriptRenderer {
    pub fn new() -> Result<Self, WorkerError> {
        let mut tera = Tera::default();
        tera.register_filter("sh_quote", sh_quote_filter);
        tera.add_raw_template(WORKER_TEMPLATE_NAME, WORKER_TEMPLATE)?;
        Ok(Self { tera })
    }

    pub fn render(&self, spec: &WorkerSpec, layout: &ChannelLayout) -> Result<String, WorkerError> {
        let ctx = ScriptContext {
            project: spec.project.0.clone(),
            working_dir: spec.working_dir.display().to_string(),
            command_file: layout.command_path().display().to_string(),
            status_file: layout.status_path().display().to_string(),
            steps: spec
                .build_steps
                .iter()
                .map(|step| StepContext {
                    name: step.clone(),
                    path: spec.working_dir.join(step).display().to_string(),
                })
                .collect(),
            hold_secs: spec.status_hold.as_secs(),
            poll_secs: WORKER_POLL_SECS,
            staging_ext: WORKER_STAGING_EXT,
        };
        let context = Context::from_serialize(&ctx)?;
        Ok(self.tera.render(WORKER_TEMPLATE_NAME, &context)?)
    }

    /// Render and write the script to `layout.script_path()`.
    pub fn write(&self, spec: &WorkerSpec, layout: &ChannelLayout) -> Result<PathBuf, WorkerError> {
        let script = self.render(spec, layout)?;
        let path = layout.script_path();
        std::fs::write(&path, script).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }
}

/// Single-quote a value for POSIX sh.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn sh_quote_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Value::String(sh_quote(&raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use keel_core::ProjectName;

    fn spec(steps: &[&str]) -> WorkerSpec {
        WorkerSpec {
            project: ProjectName::from("core"),
            working_dir: PathBuf::from("/work/core"),
            build_steps: steps.iter().map(|s| s.to_string()).collect(),
            status_hold: Duration::from_secs(6),
        }
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn script_runs_steps_in_order() {
        let renderer = ScriptRenderer::new().expect("renderer");
        let layout = ChannelLayout::for_project(Path::new("/state"), &ProjectName::from("core"));
        let script = renderer
            .render(&spec(&["build.sh", "package.sh"]), &layout)
            .expect("render");

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("COMMAND_FILE='/state/core/command'"));
        assert!(script.contains("STATUS_FILE='/state/core/status'"));
        let build = script.find("sh '/work/core/build.sh'").expect("build step");
        let package = script.find("sh '/work/core/package.sh'").expect("package step");
        assert!(build < package, "steps must keep configured order");
        assert!(script.contains("[1/2] executing"));
        assert!(script.contains("sleep 6"));
    }

    #[test]
    fn script_without_steps_still_implements_protocol() {
        let renderer = ScriptRenderer::new().expect("renderer");
        let layout = ChannelLayout::for_project(Path::new("/state"), &ProjectName::from("core"));
        let script = renderer.render(&spec(&[]), &layout).expect("render");
        assert!(script.contains("return 0"));
        assert!(script.contains("BUILD*)"));
        assert!(script.contains("EXIT*)"));
        assert!(script.contains("write_slot \"$COMMAND_FILE\" WAIT"));
    }

    #[test]
    fn slots_are_only_replaced_by_rename() {
        let renderer = ScriptRenderer::new().expect("renderer");
        let layout = ChannelLayout::for_project(Path::new("/state"), &ProjectName::from("core"));
        let script = renderer
            .render(&spec(&["build.sh", "package.sh"]), &layout)
            .expect("render");

        for direct in ["> \"$STATUS_FILE\"", ">> \"$STATUS_FILE\"", "> \"$COMMAND_FILE\""] {
            assert!(!script.contains(direct), "slot written in place: {direct}");
        }
        assert!(script.contains("mv -f \"$1.new\" \"$1\""));
        assert!(script.contains("mv -f \"$STATUS_FILE.new\" \"$STATUS_FILE\""));
        assert!(script.contains("append_status \"ERROR:\"'package.sh'\":$code\""));
        assert!(script.contains("write_slot \"$STATUS_FILE\" \"RUNNING:\"'build.sh'"));
    }
}
