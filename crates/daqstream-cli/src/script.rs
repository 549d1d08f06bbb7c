//! Setup command script loader
//!
//! Line-oriented text consumed before an acquisition: `#`-prefixed lines
//! are comments, every other line is `<command-name> <sleep-seconds>
//! [<arg>...]`. Integer-looking argument tokens become integers, the rest
//! must parse as floats.

use std::path::Path;

use anyhow::{bail, Context, Result};

use daqstream_core::layout::Value;

/// One setup step: a command, its arguments, and how long to wait after it.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupCommand {
    pub name: String,
    pub sleep: f64,
    pub args: Vec<Value>,
}

pub fn load_script(path: &Path) -> Result<Vec<SetupCommand>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading setup script {}", path.display()))?;
    parse_script(&text).with_context(|| format!("parsing setup script {}", path.display()))
}

pub fn parse_script(text: &str) -> Result<Vec<SetupCommand>> {
    let mut commands = Vec::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = idx + 1;

        let mut tokens = line.split_whitespace();
        let name = tokens
            .next()
            .map(str::to_string)
            .with_context(|| format!("line {line_no}: missing command name"))?;
        let sleep = tokens
            .next()
            .with_context(|| format!("line {line_no}: missing sleep time"))?
            .parse::<f64>()
            .with_context(|| format!("line {line_no}: bad sleep time"))?;

        let mut args = Vec::new();
        for token in tokens {
            if let Ok(v) = token.parse::<i64>() {
                args.push(Value::Int(v));
            } else if let Ok(v) = token.parse::<f64>() {
                args.push(Value::Float(v));
            } else {
                bail!("line {line_no}: argument {token:?} is not numeric");
            }
        }

        commands.push(SetupCommand { name, sleep, args });
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_typed_args() {
        let script = "\
# bring-up sequence
status 0.5
dac 0.1 1 2000
pulser_setup 0.1 20000 0.3

fpgatrig 0 1
";
        let commands = parse_script(script).unwrap();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0].name, "status");
        assert_eq!(commands[0].sleep, 0.5);
        assert!(commands[0].args.is_empty());

        assert_eq!(commands[1].args, vec![Value::Int(1), Value::Int(2000)]);
        assert_eq!(
            commands[2].args,
            vec![Value::Int(20000), Value::Float(0.3)]
        );
        // Integer-looking sleep values are still floats.
        assert_eq!(commands[3].sleep, 0.0);
    }

    #[test]
    fn rejects_missing_sleep() {
        assert!(parse_script("status\n").is_err());
    }

    #[test]
    fn rejects_non_numeric_argument() {
        let err = parse_script("dac 0.1 one 2000\n").unwrap_err();
        assert!(err.to_string().contains("not numeric"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let commands = parse_script("# only comments\n\n   \n").unwrap();
        assert!(commands.is_empty());
    }
}
