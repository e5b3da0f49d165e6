/// Operator prompts
///
/// Engines never touch stdin directly; they ask a [`Prompter`]. The terminal
/// implementation blocks on input, the non-interactive one answers every
/// question with the caller's default.

use anyhow::Result;
use std::io::{self, BufRead, Write};

pub trait Prompter: Send + Sync {
    /// Yes/no question; `default` is used on empty input
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// Free-form value; `default` is used on empty input
    fn ask(&self, question: &str, default: &str) -> Result<String>;

    fn is_interactive(&self) -> bool;
}

/// Reads answers from stdin
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(prompt: &str) -> Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let answer = Self::read_line(&format!("{} {} ", question, hint))?;
            match parse_yes_no(&answer, default) {
                Some(value) => return Ok(value),
                None => println!("Please answer 'y' or 'n'."),
            }
        }
    }

    fn ask(&self, question: &str, default: &str) -> Result<String> {
        let answer = Self::read_line(&format!("{} [{}]: ", question, default))?;
        if answer.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(answer)
        }
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Non-interactive mode: every question takes its default
pub struct AssumeDefaults;

impl Prompter for AssumeDefaults {
    fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
        Ok(default)
    }

    fn ask(&self, _question: &str, default: &str) -> Result<String> {
        Ok(default.to_string())
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

/// Interpret a yes/no answer; `None` for anything unrecognised
pub fn parse_yes_no(answer: &str, default: bool) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub use scripted::ScriptedPrompter;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yes_no() {
        assert_eq!(parse_yes_no("", true), Some(true));
        assert_eq!(parse_yes_no("", false), Some(false));
        assert_eq!(parse_yes_no("YES", false), Some(true));
        assert_eq!(parse_yes_no(" n ", true), Some(false));
        assert_eq!(parse_yes_no("maybe", true), None);
    }

    #[test]
    fn test_assume_defaults() {
        let p = AssumeDefaults;
        assert!(p.confirm("go?", true).unwrap());
        assert!(!p.confirm("delete?", false).unwrap());
        assert_eq!(p.ask("TZ", "UTC").unwrap(), "UTC");
        assert!(!p.is_interactive());
    }

    #[test]
    fn test_scripted_prompter() {
        let p = ScriptedPrompter::new(&["n", "", "Europe/Berlin"]);
        assert!(!p.confirm("first", true).unwrap());
        assert!(p.confirm("second", true).unwrap());
        assert_eq!(p.ask("TZ", "UTC").unwrap(), "Europe/Berlin");
        assert_eq!(p.ask("exhausted", "fallback").unwrap(), "fallback");
        assert_eq!(p.asked.lock().unwrap().len(), 4);
    }
}
