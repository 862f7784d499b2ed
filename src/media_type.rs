//! Media type parsing and canonical formatting
//!
//! Content types from upstream are parsed strictly (RFC 7231 §3.1.1.1) and
//! re-serialized before being forwarded, so a header such as
//! `image/png, text/html` can never reach a client.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::MediaTypeError;

/// Bytes left unescaped in an RFC 2231 extended parameter value
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

fn is_tspecial(c: char) -> bool {
    matches!(
        c,
        '(' | ')' | '<' | '>' | '@' | ',' | ';' | ':' | '\\' | '"' | '/' | '[' | ']' | '?' | '='
    )
}

fn is_token_char(c: char) -> bool {
    c > ' ' && c < '\x7f' && !is_tspecial(c)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_token_char)
}

/// Split a leading token off `v`
fn consume_token(v: &str) -> (&str, &str) {
    let end = v.find(|c: char| !is_token_char(c)).unwrap_or(v.len());
    v.split_at(end)
}

/// Split a leading token or quoted-string off `v`, unescaping the latter
fn consume_value(v: &str) -> Option<(String, &str)> {
    let Some(quoted) = v.strip_prefix('"') else {
        let (token, rest) = consume_token(v);
        return (!token.is_empty()).then(|| (token.to_string(), rest));
    };

    let mut out = String::new();
    let mut chars = quoted.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, &quoted[i + 1..])),
            '\\' => {
                let (_, escaped) = chars.next()?;
                out.push(escaped);
            }
            '\r' | '\n' => return None,
            _ => out.push(c),
        }
    }
    None
}

/// Split one `; key=value` parameter off `v`
fn consume_param(v: &str) -> Option<(String, String, &str)> {
    let rest = v.trim_start().strip_prefix(';')?.trim_start();
    let (key, rest) = consume_token(rest);
    if key.is_empty() {
        return None;
    }
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let (value, rest) = consume_value(rest)?;
    Some((key.to_ascii_lowercase(), value, rest))
}

/// A parsed `type/subtype` with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    params: BTreeMap<String, String>,
}

impl MediaType {
    pub fn parse(input: &str) -> Result<Self, MediaTypeError> {
        let (base, mut rest) = match input.find(';') {
            Some(i) => input.split_at(i),
            None => (input, ""),
        };

        let essence = base.trim().to_ascii_lowercase();
        if essence.is_empty() {
            return Err(MediaTypeError::Empty);
        }
        let (major, after) = consume_token(&essence);
        if major.is_empty() {
            return Err(MediaTypeError::InvalidToken);
        }
        let after = after.strip_prefix('/').ok_or(MediaTypeError::MissingSlash)?;
        let (minor, trailing) = consume_token(after);
        if minor.is_empty() {
            return Err(MediaTypeError::MissingSubtype);
        }
        if !trailing.is_empty() {
            return Err(MediaTypeError::InvalidToken);
        }

        let mut params = BTreeMap::new();
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            let Some((key, value, next)) = consume_param(rest) else {
                // tolerate trailing semicolons
                if rest.trim() == ";" {
                    break;
                }
                return Err(MediaTypeError::InvalidParameter);
            };
            if params.contains_key(&key) {
                return Err(MediaTypeError::DuplicateParameter(key));
            }
            params.insert(key, value);
            rest = next;
        }

        Ok(Self { essence, params })
    }

    /// The lowercased `type/subtype`
    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (key, value) in &self.params {
            if !value.is_ascii() {
                write!(
                    f,
                    "; {}*=utf-8''{}",
                    key,
                    utf8_percent_encode(value, ATTR_CHAR)
                )?;
            } else if is_token(value) {
                write!(f, "; {}={}", key, value)?;
            } else {
                write!(f, "; {}=\"", key)?;
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("\"")?;
            }
        }
        Ok(())
    }
}
