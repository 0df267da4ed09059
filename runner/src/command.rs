use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, process::Command};

/// placeholder name -> substituted value
pub type Placeholders = BTreeMap<&'static str, String>;

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

/// An external command with `{name}` placeholders in its arguments.
///
/// Written in the config either as a single line (split on whitespace) or as an argv list,
/// the latter being needed for empty or space-containing arguments.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "CommandSpec", into = "Vec<String>")]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl From<CommandSpec> for CommandTemplate {
    fn from(spec: CommandSpec) -> Self {
        match spec {
            CommandSpec::Line(line) => Self {
                argv: line.split_whitespace().map(str::to_owned).collect(),
            },
            CommandSpec::Argv(argv) => Self { argv },
        }
    }
}

impl From<CommandTemplate> for Vec<String> {
    fn from(template: CommandTemplate) -> Self {
        template.argv
    }
}

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    /// true if any argument mentions `{key}`
    pub fn references(&self, key: &str) -> bool {
        let needle = format!("{{{key}}}");

        self.argv.iter().any(|arg| arg.contains(&needle))
    }

    pub fn render(&self, vars: &Placeholders) -> Vec<String> {
        self.argv.iter().map(|arg| substitute(arg, vars)).collect()
    }

    /// render into a `Command`, `None` for an empty template
    pub fn to_command(&self, vars: &Placeholders) -> Option<Command> {
        let rendered = self.render(vars);
        let (program, args) = rendered.split_first()?;
        let mut command = Command::new(program);
        command.args(args);

        Some(command)
    }
}

/// substitute every known `{key}`, unknown placeholders are left untouched
pub fn substitute(arg: &str, vars: &Placeholders) -> String {
    vars.iter().fold(arg.to_owned(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// printable form of a rendered argv for logs
pub fn display_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("{arg:?}")
            } else {
                arg.clone()
            }
        })
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_and_argv_forms() {
        let line: CommandTemplate = serde_yaml::from_str("python -m ngen.cal {config}").unwrap();
        let argv: CommandTemplate =
            serde_yaml::from_str("[\"partitionGenerator\", \"{gpkg}\", \"\"]").unwrap();

        assert_eq!(line, CommandTemplate::new(["python", "-m", "ngen.cal", "{config}"]));
        assert_eq!(argv.render(&Placeholders::new()), vec!["partitionGenerator", "{gpkg}", ""]);
    }

    #[test]
    fn renders_known_placeholders() {
        let template = CommandTemplate::new(["{python}", "{sandbox_dir}/validation.py", "{nope}"]);
        let vars = Placeholders::from([
            ("python", "python3".to_owned()),
            ("sandbox_dir", "/opt/sandbox".to_owned()),
        ]);

        assert!(template.references("sandbox_dir"));
        assert!(!template.references("config"));
        assert_eq!(
            template.render(&vars),
            vec!["python3", "/opt/sandbox/validation.py", "{nope}"]
        );
    }

    #[test]
    fn display_quotes_awkward_arguments() {
        let argv = vec!["gen".to_owned(), "".to_owned(), "a b".to_owned()];

        assert_eq!(display_argv(&argv), "gen \"\" \"a b\"");
    }
}
