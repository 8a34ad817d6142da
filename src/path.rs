//! Path expressions over variable values.
//!
//! An expression has the shape `name (accessor)* (':' default)?` where an
//! accessor is either `[index]` or `.property`:
//!
//! - `users[0].name` takes the first element of `users`, then its `name`;
//! - `token:anonymous` falls back to the literal `anonymous` when `token`
//!   resolves to nothing. Everything after the first unescaped colon is the
//!   default, colons included.
//!
//! Indexing a non-list value, or reading a property a record does not
//! have, keeps the current value unchanged. Missing map keys and
//! out-of-range indexes resolve to nothing.

use crate::value::VariableValue;
use thiserror::Error;

/// Malformed path expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid variable path '{path}' at position {position}: {reason}")]
pub struct PathError {
    pub path: String,
    pub position: usize,
    pub reason: String,
}

/// One step of an accessor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// `[index]`
    Index(usize),
    /// `.name`; `remainder` is the raw chain text from `name` onwards.
    Property { name: String, remainder: String },
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpression {
    /// Head variable name.
    pub name: String,
    pub accessors: Vec<Accessor>,
    /// Literal text after the first unescaped colon.
    pub default: Option<String>,
    /// Expression text without the default suffix.
    pub target: String,
}

impl PathExpression {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        Parser::new(path).parse()
    }

    pub fn has_accessors(&self) -> bool {
        !self.accessors.is_empty()
    }

    /// Walk the accessor chain starting at `root`. The default is not
    /// applied.
    pub fn apply(&self, root: Option<&VariableValue>) -> Option<VariableValue> {
        let mut current = root.cloned()?.non_null()?;
        for (idx, accessor) in self.accessors.iter().enumerate() {
            current = match accessor {
                Accessor::Index(index) => match current {
                    VariableValue::List(mut items) => {
                        if *index >= items.len() {
                            return None;
                        }
                        items.swap_remove(*index).non_null()?
                    }
                    other => other,
                },
                Accessor::Property { name, remainder } => match current {
                    VariableValue::Map(mut map) => {
                        // A key spelled like the rest of the chain wins
                        // over walking it piece by piece.
                        if idx + 1 < self.accessors.len() {
                            if let Some(value) = map.remove(remainder) {
                                return value.non_null();
                            }
                        }
                        map.remove(name)?.non_null()?
                    }
                    VariableValue::Record(record) => {
                        match record.property(name) {
                            Some(value) => value.non_null()?,
                            None => VariableValue::Record(record),
                        }
                    }
                    other => other,
                },
            };
        }
        Some(current)
    }

    /// Walk the chain and fall back to the default when nothing is found.
    pub fn resolve(&self, root: Option<&VariableValue>) -> Option<VariableValue> {
        self.apply(root).or_else(|| {
            self.default.as_ref().map(|d| VariableValue::String(d.clone()))
        })
    }
}

/// Resolve `path` against `root`, the value bound to the path's head name.
pub fn resolve(
    root: Option<&VariableValue>,
    path: &str,
) -> Result<Option<VariableValue>, PathError> {
    Ok(PathExpression::parse(path)?.resolve(root))
}

struct Parser<'a> {
    path: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            chars: path.char_indices().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> PathError {
        PathError {
            path: self.path.to_string(),
            position: self.offset(),
            reason: reason.into(),
        }
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.path.len())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn parse(mut self) -> Result<PathExpression, PathError> {
        let name = self.identifier();
        if name.is_empty() && self.peek().is_some_and(|c| c != ':') {
            return Err(self.error("accessor without a variable name"));
        }

        let mut accessors = Vec::new();
        let mut default = None;
        let mut target_end = self.path.len();

        while let Some(c) = self.peek() {
            match c {
                '[' => {
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    if self.pos == start {
                        return Err(self.error("expected a list index"));
                    }
                    if self.peek() != Some(']') {
                        return Err(self.error("expected ']'"));
                    }
                    let digits: String = self.chars[start..self.pos]
                        .iter()
                        .map(|(_, c)| *c)
                        .collect();
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| self.error("list index is too large"))?;
                    self.pos += 1;
                    accessors.push(Accessor::Index(index));
                }
                '.' => {
                    self.pos += 1;
                    let remainder_start = self.offset();
                    let name = self.identifier();
                    if name.is_empty() {
                        return Err(self.error("expected a property name"));
                    }
                    let remainder_end = self.chain_end();
                    let remainder = unescape(
                        &self.path[remainder_start..remainder_end],
                    );
                    accessors.push(Accessor::Property { name, remainder });
                }
                ':' => {
                    target_end = self.offset();
                    default = Some(self.path[target_end + 1..].to_string());
                    break;
                }
                other => {
                    return Err(self.error(format!(
                        "unexpected character '{other}'"
                    )));
                }
            }
        }

        Ok(PathExpression {
            name,
            accessors,
            default,
            target: unescape(&self.path[..target_end]),
        })
    }

    /// Read a name up to the next `[`, `.` or unescaped `:`.
    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            match c {
                '\\' if self.chars.get(self.pos + 1).is_some_and(|(_, n)| *n == ':') => {
                    name.push(':');
                    self.pos += 2;
                }
                '[' | ']' | '.' | ':' => break,
                _ => {
                    name.push(c);
                    self.pos += 1;
                }
            }
        }
        name
    }

    /// Byte offset where the accessor chain ends (first unescaped colon).
    fn chain_end(&self) -> usize {
        let mut idx = self.pos;
        while let Some((offset, c)) = self.chars.get(idx) {
            match c {
                '\\' if self.chars.get(idx + 1).is_some_and(|(_, n)| *n == ':') => {
                    idx += 2;
                }
                ':' => return *offset,
                _ => idx += 1,
            }
        }
        self.path.len()
    }
}

fn unescape(text: &str) -> String {
    text.replace("\\:", ":")
}
