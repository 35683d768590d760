//! Lua 테이블 대입문 파일 (`<assignment> = { ... }`).
//!
//! DCS가 쓰는 `options.lua`, `serverSettings.lua` 같은 파일은 키 경로 단위로
//! 병합하고, 익스텐션 전용 파일은 통째로 재생성합니다. 병합 시 주석과 서식은
//! DCS가 저장할 때처럼 정규화됩니다.

use std::path::Path;

use serde_json::{Map, Value};

use super::structured::set_json_path;
use super::{ConfigError, KeyPath};

pub(super) fn render_owned(
    assignment: &str,
    entries: &[(KeyPath, Value)],
    path: &Path,
) -> Result<String, ConfigError> {
    if assignment.trim().is_empty() {
        return Err(ConfigError::invalid(path, "empty Lua assignment target"));
    }
    let mut root = Value::Object(Map::new());
    for (key, value) in entries {
        set_json_path(&mut root, key.segments(), value);
    }
    Ok(format!("{} = {}\n", assignment, to_lua_table(&root)))
}

pub(super) fn render_merged(
    assignment: &str,
    existing: Option<&str>,
    entries: &[(KeyPath, Value)],
    path: &Path,
) -> Result<String, ConfigError> {
    if assignment.trim().is_empty() {
        return Err(ConfigError::invalid(path, "empty Lua assignment target"));
    }
    let mut root = match existing {
        Some(text) if !text.trim().is_empty() => {
            parse_lua_assignment(text, assignment).map_err(|e| ConfigError::unparseable(path, e))?
        }
        _ => Value::Object(Map::new()),
    };
    for (key, value) in entries {
        set_json_path(&mut root, key.segments(), value);
    }
    Ok(format!("{} = {}\n", assignment, to_lua_table(&root)))
}

/// `<assignment> = { ... }` 텍스트에서 테이블을 읽습니다.
///
/// 키가 `1..n`인 테이블은 배열, 나머지는 객체가 됩니다 (숫자 키는 문자열로).
///
/// ```
/// let v = extvisor::patcher::parse_lua_assignment(
///     "options = { [\"plugins\"] = { [\"Tacview\"] = { port = \"42674\" } } }",
///     "options",
/// ).unwrap();
/// assert_eq!(v["plugins"]["Tacview"]["port"], "42674");
/// ```
pub fn parse_lua_assignment(text: &str, assignment: &str) -> Result<Value, String> {
    let mut parser = Parser { src: text.as_bytes(), pos: 0 };
    parser.skip_trivia()?;
    let target = parser.target()?;
    if target != assignment {
        return Err(format!("expected '{}' assignment, found '{}'", assignment, target));
    }
    parser.skip_trivia()?;
    parser.expect(b'=')?;
    parser.skip_trivia()?;
    let value = parser.value()?;
    parser.skip_trivia()?;
    if parser.pos < parser.src.len() {
        return Err(format!("unexpected content at byte {}", parser.pos));
    }
    match value {
        Value::Object(_) => Ok(value),
        Value::Array(items) if items.is_empty() => Ok(Value::Object(Map::new())),
        _ => Err(format!("'{}' is not a keyed table", assignment)),
    }
}

enum TableKey {
    Index(i64),
    Name(String),
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn rest(&self) -> &[u8] {
        &self.src[self.pos.min(self.src.len())..]
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{}' at byte {}", byte as char, self.pos))
        }
    }

    /// 공백과 `--` 주석 (`--[[ ]]` 포함)
    fn skip_trivia(&mut self) -> Result<(), String> {
        loop {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.pos += 1;
            }
            if !self.rest().starts_with(b"--") {
                return Ok(());
            }
            self.pos += 2;
            if self.rest().starts_with(b"[[") {
                self.long_bracket()?;
            } else {
                while self.peek().is_some_and(|b| b != b'\n') {
                    self.pos += 1;
                }
            }
        }
    }

    /// `[[ ... ]]` 본문
    fn long_bracket(&mut self) -> Result<String, String> {
        let start = self.pos + 2;
        let Some(len) = self.src[start..].windows(2).position(|w| w == b"]]") else {
            return Err(format!("unterminated long bracket at byte {}", self.pos));
        };
        self.pos = start + len + 2;
        let body = &self.src[start..start + len];
        let body = body.strip_prefix(b"\n").unwrap_or(body);
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    fn name(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.pos += 1,
            _ => return None,
        }
        while self.peek().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    /// `a.b.c`
    fn target(&mut self) -> Result<String, String> {
        let mut target = self
            .name()
            .ok_or_else(|| format!("expected assignment target at byte {}", self.pos))?;
        while self.peek() == Some(b'.') {
            self.pos += 1;
            let part = self
                .name()
                .ok_or_else(|| format!("expected name after '.' at byte {}", self.pos))?;
            target.push('.');
            target.push_str(&part);
        }
        Ok(target)
    }

    fn value(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some(b'{') => self.table(),
            Some(b'"') | Some(b'\'') => self.string().map(Value::String),
            Some(b'[') if self.peek_at(1) == Some(b'[') => self.long_bracket().map(Value::String),
            Some(b) if b == b'-' || b == b'.' || b.is_ascii_digit() => self.number(),
            _ => match self.name().as_deref() {
                Some("true") => Ok(Value::Bool(true)),
                Some("false") => Ok(Value::Bool(false)),
                Some("nil") => Ok(Value::Null),
                Some(other) => Err(format!("unsupported expression '{}' at byte {}", other, self.pos)),
                None => Err(format!("expected value at byte {}", self.pos)),
            },
        }
    }

    fn number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while let Some(b) = self.peek() {
            let exponent_sign = (b == b'-' || b == b'+')
                && self.pos > start
                && matches!(self.src.get(self.pos - 1), Some(b'e') | Some(b'E'));
            if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Value::from(i));
        }
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid number '{}' at byte {}", text, start))
    }

    fn string(&mut self) -> Result<String, String> {
        let start = self.pos;
        let quote = self.src[self.pos];
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(format!("unterminated string at byte {}", start));
            };
            self.pos += 1;
            match b {
                b if b == quote => break,
                b'\\' => {
                    let Some(esc) = self.peek() else { continue };
                    self.pos += 1;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'0'..=b'9' => {
                            let mut code = u32::from(esc - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d) if d.is_ascii_digit() => {
                                        code = code * 10 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push(u8::try_from(code).map_err(|_| {
                                format!("escape out of range at byte {}", self.pos)
                            })?);
                        }
                        other => out.push(other),
                    }
                }
                b'\n' => return Err(format!("unterminated string at byte {}", start)),
                b => out.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn table(&mut self) -> Result<Value, String> {
        self.expect(b'{')?;
        let mut fields: Vec<(TableKey, Value)> = Vec::new();
        let mut next_index = 1;
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }

            let key = if self.peek() == Some(b'[') && self.peek_at(1) != Some(b'[') {
                self.pos += 1;
                self.skip_trivia()?;
                let key = match self.value()? {
                    Value::String(s) => TableKey::Name(s),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => TableKey::Index(i),
                        None => return Err(format!("non-integer table key {}", n)),
                    },
                    other => return Err(format!("unsupported table key {}", other)),
                };
                self.skip_trivia()?;
                self.expect(b']')?;
                self.skip_trivia()?;
                self.expect(b'=')?;
                Some(key)
            } else {
                let save = self.pos;
                match self.name() {
                    Some(name) => {
                        self.skip_trivia()?;
                        if self.peek() == Some(b'=') && self.peek_at(1) != Some(b'=') {
                            self.pos += 1;
                            Some(TableKey::Name(name))
                        } else {
                            self.pos = save;
                            None
                        }
                    }
                    None => None,
                }
            };

            self.skip_trivia()?;
            let value = self.value()?;
            let key = key.unwrap_or_else(|| {
                let k = TableKey::Index(next_index);
                next_index += 1;
                k
            });
            fields.push((key, value));

            self.skip_trivia()?;
            match self.peek() {
                Some(b',') | Some(b';') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(format!("expected ',' or '}}' at byte {}", self.pos)),
            }
        }
        Ok(build_table(fields))
    }
}

/// 키가 정확히 `1..n`이면 배열
fn build_table(fields: Vec<(TableKey, Value)>) -> Value {
    if fields.is_empty() {
        return Value::Object(Map::new());
    }
    let mut indexed: Vec<(i64, &Value)> = Vec::with_capacity(fields.len());
    for (key, value) in &fields {
        match key {
            TableKey::Index(i) => indexed.push((*i, value)),
            TableKey::Name(_) => break,
        }
    }
    if indexed.len() == fields.len() {
        indexed.sort_by_key(|(i, _)| *i);
        if indexed.iter().enumerate().all(|(n, (i, _))| *i == n as i64 + 1) {
            return Value::Array(indexed.into_iter().map(|(_, v)| v.clone()).collect());
        }
    }

    let mut map = Map::new();
    for (key, value) in fields {
        let key = match key {
            TableKey::Index(i) => i.to_string(),
            TableKey::Name(s) => s,
        };
        map.insert(key, value);
    }
    Value::Object(map)
}

/// JSON 값을 탭 들여쓰기 Lua 리터럴로 직렬화합니다.
///
/// ```
/// let v = serde_json::json!({"port": 10310, "name": "x"});
/// assert_eq!(extvisor::patcher::to_lua_table(&v), "{\n\t[\"port\"] = 10310,\n\t[\"name\"] = \"x\",\n}");
/// ```
pub fn to_lua_table(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, 0);
    out
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Null => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for item in items {
                indent(out, depth + 1);
                write_value(out, item, depth + 1);
                out.push_str(",\n");
            }
            indent(out, depth);
            out.push('}');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (k, v) in map {
                indent(out, depth + 1);
                out.push('[');
                // 정수 모양 키는 숫자 키로
                match k.parse::<i64>() {
                    Ok(i) if i.to_string() == *k => out.push_str(k),
                    _ => write_string(out, k),
                }
                out.push_str("] = ");
                write_value(out, v, depth + 1);
                out.push_str(",\n");
            }
            indent(out, depth);
            out.push('}');
        }
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}
