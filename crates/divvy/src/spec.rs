//! The task definition file format consumed by the `divvy` binary.
//!
//! A task definition is one JSON object naming a program to run per item
//! and where the items come from:
//!
//! ```json
//! {
//!     "program": "sh",
//!     "arguments": ["-c", "printf '%s\n' {1} >> out.txt"],
//!     "items": [[1, "a"], [2, "b"]]
//! }
//! ```
//!
//! `{0}`, `{1}`, ... in the arguments are replaced with the item's fields.
//! Instead of an inline `items` list, `items_from` names a file holding a
//! stream of JSON arrays (`-` for stdin).

use crate::task::{default_socket_path, ItemStream, Task};
use anyhow::{anyhow, bail, Context as _};
use divvy_base::{Error, Result, WorkItem};
use serde::Deserialize;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

#[derive(Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
struct TaskDescription {
    program: String,
    #[serde(default)]
    arguments: Vec<String>,
    items: Option<Vec<WorkItem>>,
    items_from: Option<PathBuf>,
    socket_path: Option<PathBuf>,
}

/// A task that runs one command per work item.
#[derive(Debug)]
pub struct CommandTask {
    description: TaskDescription,
}

impl CommandTask {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let description: TaskDescription =
            serde_json::from_reader(reader).context("parsing task definition")?;
        if description.items.is_some() == description.items_from.is_some() {
            bail!("task definition must have exactly one of `items` and `items_from`");
        }
        Ok(CommandTask { description })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("opening task definition `{}`", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
    }
}

impl Task for CommandTask {
    fn dispatch(&mut self) -> Result<ItemStream> {
        if let Some(items) = self.description.items.take() {
            return Ok(Box::new(items.into_iter().map(Ok)));
        }
        let Some(path) = &self.description.items_from else {
            bail!("task dispatched twice");
        };
        let reader: Box<dyn Read> = if path == Path::new("-") {
            Box::new(io::stdin().lock())
        } else {
            Box::new(
                fs::File::open(path)
                    .with_context(|| format!("opening item stream `{}`", path.display()))?,
            )
        };
        Ok(Box::new(
            serde_json::Deserializer::from_reader(reader)
                .into_iter::<WorkItem>()
                .map(|item| item.map_err(Error::from)),
        ))
    }

    fn perform(&self, item: WorkItem) -> Result<()> {
        let fields = item.field_strings();
        let arguments = self
            .description
            .arguments
            .iter()
            .map(|argument| substitute(argument, &fields))
            .collect::<Result<Vec<_>>>()?;
        let status = Command::new(&self.description.program)
            .args(&arguments)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("running `{}`", self.description.program))?;
        if !status.success() {
            bail!("`{}` failed: {status}", self.description.program);
        }
        Ok(())
    }

    fn socket_path(&self) -> PathBuf {
        self.description
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path)
    }
}

/// Replace `{0}`, `{1}`, ... with the item's fields. Braced tokens that are
/// not all digits pass through untouched, so shell templates keep their
/// `${VAR}` expansions.
fn substitute(template: &str, fields: &[String]) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        rest = &rest[open..];
        let Some(close) = rest.find('}') else {
            break;
        };
        let token = &rest[1..close];
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            let index = token.parse::<usize>()?;
            let field = fields.get(index).ok_or_else(|| {
                anyhow!(
                    "placeholder {{{index}}} out of range for a {}-field item",
                    fields.len()
                )
            })?;
            result.push_str(field);
        } else {
            result.push_str(&rest[..=close]);
        }
        rest = &rest[close + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use divvy_base::item;
    use tempfile::TempDir;

    fn parse_task(str_: &str) -> Result<CommandTask> {
        CommandTask::from_reader(str_.as_bytes())
    }

    fn assert_error(err: Error, expected: &str) {
        let message = format!("{err:#}");
        assert!(
            message.contains(expected),
            "message: {message:?}, expected: {expected:?}"
        );
    }

    #[test]
    fn basic() {
        let mut task = parse_task(
            r#"{
                "program": "echo",
                "arguments": ["{0}"],
                "items": [[1], [2, "b"]]
            }"#,
        )
        .unwrap();
        let items = task.dispatch().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items, vec![item![1], item![2, "b"]]);
    }

    #[test]
    fn missing_program() {
        assert_error(
            parse_task(r#"{"items": [[1]]}"#).unwrap_err(),
            "missing field `program`",
        );
    }

    #[test]
    fn unknown_field() {
        assert_error(
            parse_task(r#"{"program": "echo", "items": [], "color": "red"}"#).unwrap_err(),
            "unknown field `color`",
        );
    }

    #[test]
    fn items_and_items_from_are_exclusive() {
        assert_error(
            parse_task(r#"{"program": "echo", "items": [], "items_from": "x"}"#).unwrap_err(),
            "exactly one of `items` and `items_from`",
        );
        assert_error(
            parse_task(r#"{"program": "echo"}"#).unwrap_err(),
            "exactly one of `items` and `items_from`",
        );
    }

    #[test]
    fn items_from_file() {
        let dir = TempDir::new().unwrap();
        let items_path = dir.path().join("items.jsonl");
        fs::write(&items_path, "[1, \"a\"]\n[2]\n").unwrap();
        let mut task = parse_task(&format!(
            r#"{{"program": "echo", "items_from": "{}"}}"#,
            items_path.display()
        ))
        .unwrap();
        let items = task.dispatch().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items, vec![item![1, "a"], item![2]]);
    }

    #[test]
    fn items_from_file_with_bad_entry() {
        let dir = TempDir::new().unwrap();
        let items_path = dir.path().join("items.jsonl");
        fs::write(&items_path, "[1]\nnot json\n").unwrap();
        let mut task = parse_task(&format!(
            r#"{{"program": "echo", "items_from": "{}"}}"#,
            items_path.display()
        ))
        .unwrap();
        let mut stream = task.dispatch().unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), item![1]);
        assert_matches!(stream.next(), Some(Err(_)));
    }

    #[test]
    fn default_socket_path_used_when_unset() {
        let task = parse_task(r#"{"program": "echo", "items": []}"#).unwrap();
        assert_eq!(task.socket_path(), default_socket_path());
        let task = parse_task(
            r#"{"program": "echo", "items": [], "socket_path": "/tmp/custom.sock"}"#,
        )
        .unwrap();
        assert_eq!(task.socket_path(), Path::new("/tmp/custom.sock"));
    }

    #[test]
    fn substitute_positional_fields() {
        let fields = vec!["a".to_string(), "b".to_string()];
        assert_eq!(substitute("{0}-{1}-{0}", &fields).unwrap(), "a-b-a");
        assert_eq!(substitute("no placeholders", &fields).unwrap(), "no placeholders");
    }

    #[test]
    fn substitute_leaves_shell_expansions_alone() {
        let fields = vec!["a".to_string()];
        assert_eq!(
            substitute("echo ${HOME} {0} {}", &fields).unwrap(),
            "echo ${HOME} a {}"
        );
        assert_eq!(substitute("dangling {", &fields).unwrap(), "dangling {");
    }

    #[test]
    fn substitute_out_of_range() {
        assert_error(
            substitute("{2}", &["a".to_string()]).unwrap_err(),
            "placeholder {2} out of range for a 1-field item",
        );
    }

    #[test]
    fn perform_runs_the_command() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let task = parse_task(&format!(
            r#"{{
                "program": "sh",
                "arguments": ["-c", "printf '%s %s' {{0}} {{1}} > {}"],
                "items": []
            }}"#,
            out.display()
        ))
        .unwrap();
        task.perform(item![7, "seven"]).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "7 seven");
    }

    #[test]
    fn perform_surfaces_command_failure() {
        let task = parse_task(
            r#"{"program": "sh", "arguments": ["-c", "exit 3"], "items": []}"#,
        )
        .unwrap();
        assert_error(task.perform(item![]).unwrap_err(), "`sh` failed");
    }
}
