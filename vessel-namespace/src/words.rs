//! Shell-style word splitting for simulation mode

use vessel_core::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a command line into words, honouring quotes and backslash escapes
///
/// Follows POSIX shell rules for quoting only: no expansion, globbing or
/// operators. `''` yields an empty word.
///
/// # Errors
///
/// Returns [`Error::InvalidCommand`] for an empty command, an unterminated
/// quote or a trailing backslash
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Quote::None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (Quote::None, '\'') => {
                quote = Quote::Single;
                in_word = true;
            }
            (Quote::None, '"') => {
                quote = Quote::Double;
                in_word = true;
            }
            (Quote::None, '\\') => {
                let escaped = chars.next().ok_or_else(|| Error::InvalidCommand {
                    message: "trailing backslash".to_string(),
                })?;
                current.push(escaped);
                in_word = true;
            }
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::Double, '\\') => match chars.next() {
                Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => {
                    return Err(Error::InvalidCommand {
                        message: "unterminated double quote".to_string(),
                    });
                }
            },
            (_, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    match quote {
        Quote::Single => {
            return Err(Error::InvalidCommand {
                message: "unterminated single quote".to_string(),
            });
        }
        Quote::Double => {
            return Err(Error::InvalidCommand {
                message: "unterminated double quote".to_string(),
            });
        }
        Quote::None => {}
    }

    if in_word {
        words.push(current);
    }

    if words.is_empty() {
        return Err(Error::InvalidCommand {
            message: "command is empty".to_string(),
        });
    }

    Ok(words)
}
