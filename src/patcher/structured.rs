//! JSON / TOML 어댑터 — 키 경로 단위 병합.

use std::path::Path;

use serde_json::{Map, Value};
use toml_edit::{DocumentMut, Item, Table, TableLike};

use super::{ConfigError, KeyPath};

// ═══════════════════════════════════════════════════════
// JSON
// ═══════════════════════════════════════════════════════

pub(super) fn render_json(
    existing: Option<&str>,
    entries: &[(KeyPath, Value)],
    path: &Path,
) -> Result<String, ConfigError> {
    let mut root = match existing {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str::<Value>(text).map_err(|e| ConfigError::unparseable(path, e))?
        }
        _ => Value::Object(Map::new()),
    };
    if !root.is_object() {
        return Err(ConfigError::unparseable(path, "top-level value is not an object"));
    }

    for (key, value) in entries {
        set_json_path(&mut root, key.segments(), value);
    }

    let mut out =
        serde_json::to_string_pretty(&root).map_err(|e| ConfigError::invalid(path, e))?;
    out.push('\n');
    Ok(out)
}

/// `segments` 위치에 `value`를 병합. 중간 노드가 객체가 아니면 객체로 교체합니다.
pub(super) fn set_json_path(root: &mut Value, segments: &[String], value: &Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cur = root;
    for seg in parents {
        cur = child_object(cur, seg);
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    if let Value::Object(map) = cur {
        merge_json(map.entry(last.clone()).or_insert(Value::Null), value);
    }
}

fn child_object<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// 객체끼리는 재귀 병합, 그 외는 덮어쓰기
fn merge_json(target: &mut Value, value: &Value) {
    match (target, value) {
        (Value::Object(t), Value::Object(v)) => {
            for (k, vv) in v {
                merge_json(t.entry(k.clone()).or_insert(Value::Null), vv);
            }
        }
        (t, v) => {
            if t != v {
                *t = v.clone();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════
// TOML
// ═══════════════════════════════════════════════════════

pub(super) fn render_toml(
    existing: Option<&str>,
    entries: &[(KeyPath, Value)],
    path: &Path,
) -> Result<String, ConfigError> {
    let mut doc: DocumentMut = existing
        .unwrap_or("")
        .parse()
        .map_err(|e: toml_edit::TomlError| ConfigError::unparseable(path, e))?;

    for (key, value) in entries {
        let Some((last, parents)) = key.segments().split_last() else {
            continue;
        };
        let mut table: &mut dyn TableLike = doc.as_table_mut();
        for seg in parents {
            let current = table;
            table = descend(current, seg).ok_or_else(|| {
                ConfigError::invalid(path, format!("'{}' is not a table", seg))
            })?;
        }
        merge_toml(table, last, value, path)?;
    }

    Ok(doc.to_string())
}

fn descend<'a>(table: &'a mut dyn TableLike, key: &str) -> Option<&'a mut dyn TableLike> {
    let item = table.entry(key).or_insert(Item::Table(Table::new()));
    if item.as_table_like().is_none() {
        *item = Item::Table(Table::new());
    }
    item.as_table_like_mut()
}

fn merge_toml(
    table: &mut dyn TableLike,
    key: &str,
    value: &Value,
    path: &Path,
) -> Result<(), ConfigError> {
    match value {
        Value::Object(map) => {
            let sub = descend(table, key)
                .ok_or_else(|| ConfigError::invalid(path, format!("'{}' is not a table", key)))?;
            for (k, v) in map {
                merge_toml(sub, k, v, path)?;
            }
        }
        other => {
            let wanted = json_to_toml(other)
                .ok_or_else(|| ConfigError::invalid(path, format!("'{}' has no TOML form", key)))?;
            // 의미상 같은 값이면 원래 서식(따옴표, 주석 등) 유지
            let same = table
                .get(key)
                .and_then(|item| item.as_value())
                .map(|current| same_toml_value(current, &wanted))
                .unwrap_or(false);
            if !same {
                table.insert(key, Item::Value(wanted));
            }
        }
    }
    Ok(())
}

fn json_to_toml(value: &Value) -> Option<toml_edit::Value> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => toml_edit::Value::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => toml_edit::Value::from(i),
            None => toml_edit::Value::from(n.as_f64()?),
        },
        Value::String(s) => toml_edit::Value::from(s.as_str()),
        Value::Array(items) => {
            let mut array = toml_edit::Array::new();
            for item in items {
                array.push(json_to_toml(item)?);
            }
            toml_edit::Value::from(array)
        }
        Value::Object(map) => {
            let mut inline = toml_edit::InlineTable::new();
            for (k, v) in map {
                inline.insert(k.as_str(), json_to_toml(v)?);
            }
            toml_edit::Value::from(inline)
        }
    })
}

fn same_toml_value(a: &toml_edit::Value, b: &toml_edit::Value) -> bool {
    use toml_edit::Value as V;
    match (a, b) {
        (V::String(x), V::String(y)) => x.value() == y.value(),
        (V::Integer(x), V::Integer(y)) => x.value() == y.value(),
        (V::Float(x), V::Float(y)) => x.value() == y.value(),
        (V::Boolean(x), V::Boolean(y)) => x.value() == y.value(),
        _ => a.to_string().trim() == b.to_string().trim(),
    }
}
