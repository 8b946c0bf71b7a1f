//! Reader for the textual proto-like declaration files (`BUILDUNIT`,
//! `PRESUBMIT`).
//!
//! The syntax is a flat sequence of `name { ... }` blocks whose bodies mix
//! `field: value` scalars and nested blocks. Values are quoted strings,
//! integers, booleans, or bare enum identifiers. `#` starts a comment.
//! The reader is strict about structure (unbalanced braces and unterminated
//! strings fail fast) and tolerant about content: consumers pick the fields
//! they know and ignore the rest.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TextFileError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

pub type Result<T> = std::result::Result<T, TextFileError>;

/// A scalar or nested value.
#[derive(Debug, Clone, PartialEq)]
pub enum TextValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Bare identifier, used for enum constants like `NOTIFY_ALWAYS`.
    Ident(String),
    Message(TextMessage),
}

impl TextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Ident(s) => Some(s),
            _ => None,
        }
    }
}

/// An ordered field list; repeated field names are meaningful.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextMessage {
    pub fields: Vec<(String, TextValue)>,
}

impl TextMessage {
    /// All string/ident values of a repeated field, in order.
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(n, _)| n == name)
            .filter_map(|(_, v)| v.as_str().map(str::to_string))
            .collect()
    }

    /// First string/ident value of a field.
    pub fn string(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_str().map(str::to_string))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.fields.iter().find_map(|(n, v)| match v {
            TextValue::Int(i) if n == name => Some(*i),
            _ => None,
        })
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.fields.iter().find_map(|(n, v)| match v {
            TextValue::Bool(b) if n == name => Some(*b),
            _ => None,
        })
    }

    /// All nested messages of a repeated field, in order.
    pub fn messages(&self, name: &str) -> Vec<&TextMessage> {
        self.fields
            .iter()
            .filter_map(|(n, v)| match v {
                TextValue::Message(m) if n == name => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn message(&self, name: &str) -> Option<&TextMessage> {
        self.messages(name).into_iter().next()
    }
}

impl fmt::Display for TextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            match value {
                TextValue::Message(m) => write!(f, "{name} {{ {m} }} ")?,
                TextValue::Str(s) => write!(f, "{name}: {s:?} ")?,
                TextValue::Int(i) => write!(f, "{name}: {i} ")?,
                TextValue::Bool(b) => write!(f, "{name}: {b} ")?,
                TextValue::Ident(s) => write!(f, "{name}: {s} ")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Colon,
    OpenBrace,
    CloseBrace,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn err(&self, message: impl Into<String>) -> TextFileError {
        TextFileError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Option<(Token, usize)>> {
        loop {
            match self.chars.peek() {
                None => return Ok(None),
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('#') => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                Some(_) => break,
            }
        }
        let line = self.line;
        let c = *self.chars.peek().unwrap();
        let token = match c {
            ':' => {
                self.chars.next();
                Token::Colon
            }
            '{' => {
                self.chars.next();
                Token::OpenBrace
            }
            '}' => {
                self.chars.next();
                Token::CloseBrace
            }
            '"' => {
                self.chars.next();
                let mut s = String::new();
                loop {
                    match self.chars.next() {
                        None => return Err(self.err("unterminated string")),
                        Some('\n') => return Err(self.err("unterminated string")),
                        Some('"') => break,
                        Some('\\') => match self.chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other @ ('"' | '\\')) => s.push(other),
                            _ => return Err(self.err("bad escape in string")),
                        },
                        Some(other) => s.push(other),
                    }
                }
                Token::Str(s)
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(self.chars.next().unwrap());
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                let value = s
                    .parse::<i64>()
                    .map_err(|_| self.err(format!("bad integer {s:?}")))?;
                Token::Int(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(s)
            }
            other => return Err(self.err(format!("unexpected character {other:?}"))),
        };
        Ok(Some((token, line)))
    }
}

/// Parse a whole declaration file into a top-level message.
pub fn parse(input: &str) -> Result<TextMessage> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token()? {
        tokens.push(tok);
    }
    let mut pos = 0;
    let msg = parse_fields(&tokens, &mut pos, true)?;
    Ok(msg)
}

fn parse_fields(tokens: &[(Token, usize)], pos: &mut usize, top: bool) -> Result<TextMessage> {
    let mut message = TextMessage::default();
    loop {
        match tokens.get(*pos) {
            None => {
                if top {
                    return Ok(message);
                }
                let line = tokens.last().map_or(0, |(_, l)| *l);
                return Err(TextFileError::Syntax {
                    line,
                    message: "unbalanced braces: missing }".to_string(),
                });
            }
            Some((Token::CloseBrace, line)) => {
                if top {
                    return Err(TextFileError::Syntax {
                        line: *line,
                        message: "unbalanced braces: unexpected }".to_string(),
                    });
                }
                *pos += 1;
                return Ok(message);
            }
            Some((Token::Ident(name), line)) => {
                let name = name.clone();
                let line = *line;
                *pos += 1;
                match tokens.get(*pos) {
                    Some((Token::Colon, _)) => {
                        *pos += 1;
                        let value = match tokens.get(*pos) {
                            Some((Token::Str(s), _)) => TextValue::Str(s.clone()),
                            Some((Token::Int(i), _)) => TextValue::Int(*i),
                            Some((Token::Ident(id), _)) => match id.as_str() {
                                "true" => TextValue::Bool(true),
                                "false" => TextValue::Bool(false),
                                other => TextValue::Ident(other.to_string()),
                            },
                            Some((Token::OpenBrace, _)) => {
                                *pos += 1;
                                let nested = parse_fields(tokens, pos, false)?;
                                message.fields.push((name, TextValue::Message(nested)));
                                continue;
                            }
                            _ => {
                                return Err(TextFileError::Syntax {
                                    line,
                                    message: format!("field {name}: expected a value"),
                                })
                            }
                        };
                        *pos += 1;
                        message.fields.push((name, value));
                    }
                    Some((Token::OpenBrace, _)) => {
                        *pos += 1;
                        let nested = parse_fields(tokens, pos, false)?;
                        message.fields.push((name, TextValue::Message(nested)));
                    }
                    _ => {
                        return Err(TextFileError::Syntax {
                            line,
                            message: format!("field {name}: expected : or {{"),
                        })
                    }
                }
            }
            Some((other, line)) => {
                return Err(TextFileError::Syntax {
                    line: *line,
                    message: format!("expected a field name, found {other:?}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars_and_blocks() {
        let msg = parse(
            r#"
# a comment
build_unit {
  name: "fmt"
  args: "--check"
  args: "--all"
  timeout_sec: 120
  auto: true
  policy: NOTIFY_ALWAYS
  post_submit {
    trigger_paths: "..."
  }
}
"#,
        )
        .unwrap();
        let unit = msg.message("build_unit").unwrap();
        assert_eq!(unit.string("name").as_deref(), Some("fmt"));
        assert_eq!(unit.strings("args"), vec!["--check", "--all"]);
        assert_eq!(unit.int("timeout_sec"), Some(120));
        assert_eq!(unit.bool("auto"), Some(true));
        assert_eq!(unit.string("policy").as_deref(), Some("NOTIFY_ALWAYS"));
        let ps = unit.message("post_submit").unwrap();
        assert_eq!(ps.strings("trigger_paths"), vec!["..."]);
    }

    #[test]
    fn repeated_blocks_stay_ordered() {
        let msg = parse("a { name: \"1\" } b { } a { name: \"2\" }").unwrap();
        let names: Vec<_> = msg
            .messages("a")
            .iter()
            .map(|m| m.string("name").unwrap())
            .collect();
        assert_eq!(names, vec!["1", "2"]);
    }

    #[test]
    fn colon_before_block_is_accepted() {
        let msg = parse("outer: { inner: \"x\" }").unwrap();
        assert_eq!(
            msg.message("outer").unwrap().string("inner").as_deref(),
            Some("x")
        );
    }

    #[test]
    fn unbalanced_open_brace_fails() {
        assert!(parse("a { name: \"x\"").is_err());
    }

    #[test]
    fn unbalanced_close_brace_fails() {
        assert!(parse("a { } }").is_err());
    }

    #[test]
    fn unterminated_string_fails() {
        assert!(parse("a { name: \"x }").is_err());
    }

    #[test]
    fn string_escapes() {
        let msg = parse(r#"a { v: "x\ny\"z" }"#).unwrap();
        assert_eq!(
            msg.message("a").unwrap().string("v").as_deref(),
            Some("x\ny\"z")
        );
    }

    #[test]
    fn negative_integer() {
        let msg = parse("a { v: -3 }").unwrap();
        assert_eq!(msg.message("a").unwrap().int("v"), Some(-3));
    }

    #[test]
    fn empty_input_is_empty_message() {
        assert!(parse("").unwrap().fields.is_empty());
    }
}
