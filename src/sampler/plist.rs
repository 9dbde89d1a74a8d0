//! XML property-list decoding for framed sampler records.
//!
//! Produces a [`Value`] tree. Lookups go through `Option`-returning
//! accessors so a missing or mistyped field never panics the pipeline.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Maximum container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Errors that can occur while decoding a record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("missing <plist> root element")]
    MissingRoot,

    #[error("<plist> root holds no value")]
    EmptyRoot,

    #[error("unexpected {found} inside <{context}>")]
    Unexpected { found: String, context: &'static str },

    #[error("record ended inside <{context}>")]
    UnexpectedEof { context: &'static str },

    #[error("invalid <{tag}> value {text:?}")]
    InvalidNumber { tag: &'static str, text: String },

    #[error("dict key {key:?} has no value")]
    KeyWithoutValue { key: String },

    #[error("nesting deeper than {max} levels")]
    TooDeep { max: usize },
}

/// A decoded plist value.
///
/// `<integer>` and `<real>` both decode to [`Value::Number`]; `<date>` and
/// `<data>` keep their element text as [`Value::String`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<Value>),
    Dict(HashMap<String, Value>),
}

impl Value {
    /// Looks up `key` when this value is a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Follows a chain of dict keys.
    pub fn path(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().try_fold(self, |value, key| value.get(key))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Number at `keys`, if present and numeric.
    pub fn f64_at(&self, keys: &[&str]) -> Option<f64> {
        self.path(keys)?.as_f64()
    }

    /// String at `keys`, if present and a string.
    pub fn str_at(&self, keys: &[&str]) -> Option<&str> {
        self.path(keys)?.as_str()
    }
}

/// Decode one framed record into a [`Value`].
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let mut parser = Parser {
        reader: Reader::from_str(text),
    };

    match parser.next_significant()? {
        Event::Start(e) if e.name().as_ref() == b"plist" => {}
        Event::Empty(e) if e.name().as_ref() == b"plist" => return Err(DecodeError::EmptyRoot),
        Event::Eof => return Err(DecodeError::MissingRoot),
        other => {
            return Err(DecodeError::Unexpected {
                found: describe(&other),
                context: "document",
            })
        }
    }

    let value = match parser.next_significant()? {
        Event::Start(e) => parser.parse_element(&e, 1)?,
        Event::Empty(e) => parse_empty(&e)?,
        Event::End(_) => return Err(DecodeError::EmptyRoot),
        Event::Eof => return Err(DecodeError::UnexpectedEof { context: "plist" }),
        other => {
            return Err(DecodeError::Unexpected {
                found: describe(&other),
                context: "plist",
            })
        }
    };

    match parser.next_significant()? {
        Event::End(e) if e.name().as_ref() == b"plist" => Ok(value),
        Event::Eof => Err(DecodeError::UnexpectedEof { context: "plist" }),
        other => Err(DecodeError::Unexpected {
            found: describe(&other),
            context: "plist",
        }),
    }
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    /// Next event that carries structure, skipping prolog, comments and
    /// whitespace between elements.
    fn next_significant(&mut self) -> Result<Event<'a>, DecodeError> {
        loop {
            match self.reader.read_event()? {
                Event::Decl(_) | Event::DocType(_) | Event::Comment(_) | Event::PI(_) => {}
                Event::Text(t) if t.iter().all(|b| b.is_ascii_whitespace() || *b == 0) => {}
                event => return Ok(event),
            }
        }
    }

    fn parse_element(&mut self, start: &BytesStart<'_>, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep { max: MAX_DEPTH });
        }

        match start.name().as_ref() {
            b"dict" => self.parse_dict(depth),
            b"array" => self.parse_array(depth),
            b"string" => Ok(Value::String(self.read_text("string")?)),
            b"date" => Ok(Value::String(self.read_text("date")?)),
            b"data" => Ok(Value::String(self.read_text("data")?)),
            b"integer" => {
                let text = self.read_text("integer")?;
                parse_integer(&text).map(Value::Number)
            }
            b"real" => {
                let text = self.read_text("real")?;
                parse_real(&text).map(Value::Number)
            }
            b"true" => {
                self.read_text("true")?;
                Ok(Value::Bool(true))
            }
            b"false" => {
                self.read_text("false")?;
                Ok(Value::Bool(false))
            }
            other => Err(DecodeError::Unexpected {
                found: format!("<{}>", String::from_utf8_lossy(other)),
                context: "value",
            }),
        }
    }

    fn parse_dict(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let mut map = HashMap::new();

        loop {
            let key = match self.next_significant()? {
                Event::End(e) if e.name().as_ref() == b"dict" => return Ok(Value::Dict(map)),
                Event::Start(e) if e.name().as_ref() == b"key" => self.read_text("key")?,
                Event::Empty(e) if e.name().as_ref() == b"key" => String::new(),
                Event::Eof => return Err(DecodeError::UnexpectedEof { context: "dict" }),
                other => {
                    return Err(DecodeError::Unexpected {
                        found: describe(&other),
                        context: "dict",
                    })
                }
            };

            let value = match self.next_significant()? {
                Event::Start(e) => self.parse_element(&e, depth + 1)?,
                Event::Empty(e) => parse_empty(&e)?,
                Event::Eof => return Err(DecodeError::UnexpectedEof { context: "dict" }),
                _ => return Err(DecodeError::KeyWithoutValue { key }),
            };

            map.insert(key, value);
        }
    }

    fn parse_array(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let mut items = Vec::new();

        loop {
            match self.next_significant()? {
                Event::End(e) if e.name().as_ref() == b"array" => return Ok(Value::Array(items)),
                Event::Start(e) => items.push(self.parse_element(&e, depth + 1)?),
                Event::Empty(e) => items.push(parse_empty(&e)?),
                Event::Eof => return Err(DecodeError::UnexpectedEof { context: "array" }),
                other => {
                    return Err(DecodeError::Unexpected {
                        found: describe(&other),
                        context: "array",
                    })
                }
            }
        }
    }

    /// Collects character data up to the end tag of a leaf element.
    fn read_text(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let mut text = String::new();

        loop {
            match self.reader.read_event()? {
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(c) => text.push_str(std::str::from_utf8(&c.into_inner())?),
                Event::Comment(_) => {}
                Event::End(_) => return Ok(text),
                Event::Eof => return Err(DecodeError::UnexpectedEof { context }),
                other => {
                    return Err(DecodeError::Unexpected {
                        found: describe(&other),
                        context,
                    })
                }
            }
        }
    }
}

fn parse_empty(e: &BytesStart<'_>) -> Result<Value, DecodeError> {
    match e.name().as_ref() {
        b"dict" => Ok(Value::Dict(HashMap::new())),
        b"array" => Ok(Value::Array(Vec::new())),
        b"string" | b"date" | b"data" => Ok(Value::String(String::new())),
        b"true" => Ok(Value::Bool(true)),
        b"false" => Ok(Value::Bool(false)),
        b"integer" => Err(DecodeError::InvalidNumber {
            tag: "integer",
            text: String::new(),
        }),
        b"real" => Err(DecodeError::InvalidNumber {
            tag: "real",
            text: String::new(),
        }),
        other => Err(DecodeError::Unexpected {
            found: format!("<{}/>", String::from_utf8_lossy(other)),
            context: "value",
        }),
    }
}

fn parse_integer(text: &str) -> Result<f64, DecodeError> {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(n as f64);
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Ok(n as f64);
    }
    Err(DecodeError::InvalidNumber {
        tag: "integer",
        text: text.to_string(),
    })
}

fn parse_real(text: &str) -> Result<f64, DecodeError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| DecodeError::InvalidNumber {
            tag: "real",
            text: text.to_string(),
        })
}

fn describe(event: &Event<'_>) -> String {
    match event {
        Event::Start(e) => format!("<{}>", String::from_utf8_lossy(e.name().as_ref())),
        Event::End(e) => format!("</{}>", String::from_utf8_lossy(e.name().as_ref())),
        Event::Empty(e) => format!("<{}/>", String::from_utf8_lossy(e.name().as_ref())),
        Event::Text(_) => "text".to_string(),
        Event::CData(_) => "CDATA".to_string(),
        Event::Eof => "end of input".to_string(),
        _ => "markup".to_string(),
    }
}
