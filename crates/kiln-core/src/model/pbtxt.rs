//! Minimal protobuf text-format reader for `config.pbtxt`.
//!
//! Lowers the text format into a [`serde_json::Value`] so the typed
//! configuration structs can be produced through serde. Supported subset:
//! scalar fields (`key: value`), message fields (`key { ... }`, colon
//! optional), list literals (`dims: [1, -1]`), repeated fields (a key
//! appearing more than once accumulates into an array), `#` comments,
//! double-quoted strings with the usual escapes, and bare identifiers for
//! enum values (`data_type: TYPE_FP32`).

use serde_json::{Map, Value};

use crate::error::Error;

/// Parse text-format content into a JSON object.
pub(crate) fn parse(text: &str) -> Result<Value, Error> {
    let mut lexer = Lexer::new(text);
    let object = parse_message(&mut lexer, false)?;
    Ok(Value::Object(object))
}

// ─── Lexer ────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    /// Skip whitespace, commas between fields, and `#` comments.
    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == ',' || c == ';' {
                self.bump();
            } else if c == '#' {
                while let Some(&c) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::invalid_config(
            "config.pbtxt",
            format!("line {}, column {}: {}", self.line, self.col, message.into()),
        )
    }

    fn ident(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if out.is_empty() {
            let found = self.peek().map_or("end of input".to_owned(), |c| {
                format!("'{c}'")
            });
            return Err(self.error(format!("expected identifier, found {found}")));
        }
        Ok(out)
    }

    fn string(&mut self) -> Result<String, Error> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c @ ('"' | '\\' | '\'')) => out.push(c),
                    Some(c) => return Err(self.error(format!("unknown escape '\\{c}'"))),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> Result<Value, Error> {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if let Ok(i) = out.parse::<i64>() {
            return Ok(Value::from(i));
        }
        out.parse::<f64>()
            .map(Value::from)
            .map_err(|_| self.error(format!("malformed number '{out}'")))
    }
}

// ─── Parser ───────────────────────────────────────────────────────────────────

/// Parse fields until the closing brace (`nested`) or end of input.
fn parse_message(lexer: &mut Lexer<'_>, nested: bool) -> Result<Map<String, Value>, Error> {
    let mut object = Map::new();
    loop {
        lexer.skip_trivia();
        match lexer.peek() {
            None => {
                if nested {
                    return Err(lexer.error("missing closing '}'"));
                }
                return Ok(object);
            }
            Some('}') => {
                if !nested {
                    return Err(lexer.error("unexpected '}'"));
                }
                lexer.bump();
                return Ok(object);
            }
            _ => {}
        }

        let key = lexer.ident()?;
        lexer.skip_trivia();

        let value = match lexer.peek() {
            Some(':') => {
                lexer.bump();
                lexer.skip_trivia();
                parse_value(lexer)?
            }
            Some('{') => {
                lexer.bump();
                Value::Object(parse_message(lexer, true)?)
            }
            _ => return Err(lexer.error(format!("expected ':' or '{{' after '{key}'"))),
        };

        // Repeated fields accumulate into an array.
        if let Some(existing) = object.get_mut(&key) {
            if let Value::Array(items) = existing {
                items.push(value);
            } else {
                let first = std::mem::take(existing);
                *existing = Value::Array(vec![first, value]);
            }
        } else {
            object.insert(key, value);
        }
    }
}

fn parse_value(lexer: &mut Lexer<'_>) -> Result<Value, Error> {
    match lexer.peek() {
        Some('{') => {
            lexer.bump();
            Ok(Value::Object(parse_message(lexer, true)?))
        }
        Some('[') => {
            lexer.bump();
            let mut items = Vec::new();
            loop {
                lexer.skip_trivia();
                match lexer.peek() {
                    Some(']') => {
                        lexer.bump();
                        return Ok(Value::Array(items));
                    }
                    None => return Err(lexer.error("missing closing ']'")),
                    _ => items.push(parse_value(lexer)?),
                }
            }
        }
        Some('"') => Ok(Value::from(lexer.string()?)),
        Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => lexer.number(),
        Some(_) => {
            let ident = lexer.ident()?;
            Ok(match ident.as_str() {
                "true" => Value::from(true),
                "false" => Value::from(false),
                _ => Value::from(ident),
            })
        }
        None => Err(lexer.error("expected a value")),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_and_enums() {
        let value = parse(
            r#"
            name: "resnet"
            max_batch_size: 8
            data_type: TYPE_FP32
            is_shape_tensor: false
            scale: 0.5
            "#,
        )
        .unwrap();
        assert_eq!(value["name"], json!("resnet"));
        assert_eq!(value["max_batch_size"], json!(8));
        assert_eq!(value["data_type"], json!("TYPE_FP32"));
        assert_eq!(value["is_shape_tensor"], json!(false));
        assert_eq!(value["scale"], json!(0.5));
    }

    #[test]
    fn repeated_messages_accumulate() {
        let value = parse(
            r#"
            input { name: "a" dims: [ 1 ] }
            input { name: "b" dims: [ 2, -1 ] }
            "#,
        )
        .unwrap();
        let inputs = value["input"].as_array().expect("array");
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1]["dims"], json!([2, -1]));
    }

    #[test]
    fn single_message_stays_scalar() {
        let value = parse(r#"input { name: "only" }"#).unwrap();
        assert!(value["input"].is_object());
    }

    #[test]
    fn nested_blocks_with_optional_colon() {
        let value = parse(
            r#"
            version_policy: { latest { num_versions: 2 } }
            reshape { shape: [ 3, -1 ] }
            "#,
        )
        .unwrap();
        assert_eq!(value["version_policy"]["latest"]["num_versions"], json!(2));
        assert_eq!(value["reshape"]["shape"], json!([3, -1]));
    }

    #[test]
    fn comments_are_skipped() {
        let value = parse(
            "# leading comment\nname: \"m\" # trailing\nmax_batch_size: 4\n",
        )
        .unwrap();
        assert_eq!(value["name"], json!("m"));
        assert_eq!(value["max_batch_size"], json!(4));
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let err = parse("input { name: \"a\"").unwrap_err();
        assert!(err.to_string().contains("missing closing"));
    }

    #[test]
    fn missing_separator_is_an_error() {
        let err = parse("name \"m\"").unwrap_err();
        assert!(err.to_string().contains("expected ':'"));
    }

    #[test]
    fn string_escapes() {
        let value = parse(r#"name: "a\"b\\c""#).unwrap();
        assert_eq!(value["name"], json!("a\"b\\c"));
    }
}
