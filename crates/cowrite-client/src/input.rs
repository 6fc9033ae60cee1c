//! Line-based editing commands read from stdin.

use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// One editing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `i <index> <text>`: insert `text` before visible position `index`
    Insert {
        /// Visible position
        index: usize,
        /// Text to insert; `\n` and `\t` escapes are expanded
        text: String,
    },
    /// `d <index>`: delete the character at `index`
    Delete {
        /// Visible position
        index: usize,
    },
    /// `save`: write the document to the snapshot file
    Save,
    /// `load`: merge the snapshot file into the document
    Load,
    /// `show`: redraw
    Show,
    /// `quit`
    Quit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line
            .trim_start()
            .split_once(' ')
            .unwrap_or((line.trim(), ""));

        match verb {
            "i" | "insert" => {
                let (index, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let index = parse_index(index)?;
                if text.is_empty() {
                    return Err(CommandError::MissingArgument("text"));
                }
                Ok(Self::Insert {
                    index,
                    text: unescape(text),
                })
            }
            "d" | "delete" => Ok(Self::Delete {
                index: parse_index(rest.trim())?,
            }),
            "save" => Ok(Self::Save),
            "load" => Ok(Self::Load),
            "show" | "" => Ok(Self::Show),
            "quit" | "q" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn parse_index(text: &str) -> Result<usize, CommandError> {
    if text.is_empty() {
        return Err(CommandError::MissingArgument("index"));
    }
    text.parse()
        .map_err(|_| CommandError::BadIndex(text.to_string()))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Errors for command parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Unrecognised verb
    #[error("unknown command '{0}' (try i, d, save, load, show, quit)")]
    Unknown(String),
    /// A required argument is absent
    #[error("missing {0}")]
    MissingArgument(&'static str),
    /// The index is not a non-negative integer
    #[error("bad index '{0}'")]
    BadIndex(String),
}

/// Read commands from `input` until end of stream, then send `Quit`.
///
/// Lines that do not parse are reported and skipped.
pub async fn input_loop<R: AsyncBufRead + Unpin>(input: R, commands: mpsc::Sender<Command>) {
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read input");
                break;
            }
        };

        match line.parse::<Command>() {
            Ok(cmd) => {
                let quit = cmd == Command::Quit;
                if commands.send(cmd).await.is_err() || quit {
                    return;
                }
            }
            Err(err) => tracing::warn!(%line, error = %err, "Ignoring command"),
        }
    }
    let _ = commands.send(Command::Quit).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            "i 3 hello world".parse::<Command>().unwrap(),
            Command::Insert {
                index: 3,
                text: "hello world".to_string()
            }
        );
        assert_eq!(
            "i 0 a\\nb".parse::<Command>().unwrap(),
            Command::Insert {
                index: 0,
                text: "a\nb".to_string()
            }
        );
        assert_eq!(
            "d 7".parse::<Command>().unwrap(),
            Command::Delete { index: 7 }
        );
        assert_eq!("save".parse::<Command>().unwrap(), Command::Save);
        assert_eq!("  load".parse::<Command>().unwrap(), Command::Load);
        assert_eq!("".parse::<Command>().unwrap(), Command::Show);
        assert_eq!("quit".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            "x".parse::<Command>(),
            Err(CommandError::Unknown("x".to_string()))
        );
        assert_eq!(
            "i 2".parse::<Command>(),
            Err(CommandError::MissingArgument("text"))
        );
        assert_eq!(
            "d".parse::<Command>(),
            Err(CommandError::MissingArgument("index"))
        );
        assert_eq!(
            "d -1".parse::<Command>(),
            Err(CommandError::BadIndex("-1".to_string()))
        );
    }

    #[tokio::test]
    async fn input_loop_skips_bad_lines_and_quits_at_eof() {
        let mock = tokio_test::io::Builder::new()
            .read(b"i 0 hi\nbogus\nd 1\n")
            .build();
        let (tx, mut rx) = mpsc::channel(8);

        input_loop(tokio::io::BufReader::new(mock), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(Command::Insert {
                index: 0,
                text: "hi".to_string()
            })
        );
        assert_eq!(rx.recv().await, Some(Command::Delete { index: 1 }));
        assert_eq!(rx.recv().await, Some(Command::Quit));
        assert_eq!(rx.recv().await, None);
    }
}
