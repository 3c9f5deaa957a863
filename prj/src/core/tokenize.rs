//! POSIX-style word splitting for shell steps.
//!
//! Shell steps are run as an argument vector whenever possible. Splitting
//! honours single quotes, double quotes and backslash escapes; any unquoted
//! operator or expansion means the text genuinely needs a shell.

/// Characters that require a shell when they appear unquoted.
const SHELL_OPERATORS: &[char] = &['|', '&', ';', '<', '>', '(', ')', '$', '`', '*', '?', '\n'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellWords {
    /// Plain argument vector; safe to invoke directly.
    Direct(Vec<String>),
    /// Text uses pipes, redirection, expansion or globbing.
    NeedsShell { operator: char },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("empty command")]
    Empty,
    #[error("unterminated {0} quote")]
    UnterminatedQuote(&'static str),
    #[error("trailing backslash")]
    TrailingBackslash,
}

/// Split `text` into words, or report that it needs a real shell.
pub fn split_command(text: &str) -> Result<ShellWords, TokenizeError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(TokenizeError::UnterminatedQuote("single")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(TokenizeError::UnterminatedQuote("double")),
                        },
                        Some(c @ ('$' | '`')) => return Ok(ShellWords::NeedsShell { operator: c }),
                        Some(c) => current.push(c),
                        None => return Err(TokenizeError::UnterminatedQuote("double")),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(c) => {
                    in_word = true;
                    current.push(c);
                }
                None => return Err(TokenizeError::TrailingBackslash),
            },
            c if SHELL_OPERATORS.contains(&c) => {
                return Ok(ShellWords::NeedsShell { operator: c });
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(TokenizeError::Empty);
    }
    Ok(ShellWords::Direct(words))
}
