//! Terminal commands understood by the `syncedit` binary.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `insert <offset> <text>`
    Insert { offset: usize, text: String },
    /// `delete <offset> <length>`
    Delete { offset: usize, length: usize },
    /// `caret <offset>` or `caret none`
    Caret(Option<usize>),
    Show,
    Peers,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (try 'help')", self.0)
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
commands:
  insert <offset> <text>   insert text before the character at offset
  delete <offset> <length> delete length characters at offset
  caret <offset>|none      publish (or clear) your caret
  show                     print the document
  peers                    print peer count and carets
  quit                     leave the document";

fn number(word: Option<&str>, what: &str) -> Result<usize, ParseError> {
    let word = word.ok_or_else(|| ParseError(format!("missing {}", what)))?;
    word.parse()
        .map_err(|_| ParseError(format!("{} must be a number, got '{}'", what, word)))
}

impl std::str::FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_start();
        let (word, rest) = line.split_once(' ').unwrap_or((line.trim_end(), ""));

        match word {
            "insert" | "i" => {
                let (offset, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let offset = number(Some(offset).filter(|s| !s.is_empty()), "offset")?;
                if text.is_empty() {
                    return Err(ParseError("missing text".to_string()));
                }
                Ok(Command::Insert {
                    offset,
                    text: text.to_string(),
                })
            }
            "delete" | "d" => {
                let mut args = rest.split_whitespace();
                let offset = number(args.next(), "offset")?;
                let length = number(args.next(), "length")?;
                Ok(Command::Delete { offset, length })
            }
            "caret" | "c" => match rest.trim() {
                "none" | "" => Ok(Command::Caret(None)),
                position => number(Some(position), "position").map(|p| Command::Caret(Some(p))),
            },
            "show" | "s" => Ok(Command::Show),
            "peers" | "p" => Ok(Command::Peers),
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(ParseError(format!("unknown command '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insert_keeps_spaces() {
        let cmd: Command = "insert 3 hello world ".parse().unwrap();
        assert_eq!(
            cmd,
            Command::Insert {
                offset: 3,
                text: "hello world ".to_string()
            }
        );
    }

    #[test]
    fn test_parse_delete_and_caret() {
        assert_eq!(
            "d 0 1".parse::<Command>().unwrap(),
            Command::Delete { offset: 0, length: 1 }
        );
        assert_eq!("caret 4".parse::<Command>().unwrap(), Command::Caret(Some(4)));
        assert_eq!("caret none".parse::<Command>().unwrap(), Command::Caret(None));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("show".parse::<Command>().unwrap(), Command::Show);
        assert_eq!("peers\n".parse::<Command>().unwrap(), Command::Peers);
        assert_eq!("q".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!("insert".parse::<Command>().is_err());
        assert!("insert 2".parse::<Command>().is_err());
        assert!("insert x text".parse::<Command>().is_err());
        assert!("delete 1".parse::<Command>().is_err());
        let err = "frobnicate".parse::<Command>().unwrap_err();
        assert!(err.to_string().contains("unknown command 'frobnicate'"));
    }
}
