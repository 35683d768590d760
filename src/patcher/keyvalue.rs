//! `key = value` 라인 형식 어댑터 (INI 섹션 포함).
//!
//! 키는 `[섹션, 키]` 또는 `[키]`(첫 섹션 헤더 이전의 전역 영역)입니다.
//! 기존 라인은 `=` 뒤 공백까지 그대로 두고 값만 바꾸며, 없는 키는 해당 섹션 끝에 추가합니다.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use super::{scalar_text, ConfigError, KeyPath};

pub(super) fn render(
    existing: Option<&str>,
    entries: &[(KeyPath, Value)],
    path: &Path,
) -> Result<String, ConfigError> {
    let text = existing.unwrap_or("");
    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();

    for (key, value) in entries {
        let (section, name) = match key.segments() {
            [name] => (None, name.as_str()),
            [section, name] => (Some(section.as_str()), name.as_str()),
            _ => {
                return Err(ConfigError::invalid(
                    path,
                    format!("key '{}' must be KEY or SECTION.KEY", key),
                ))
            }
        };
        let value = scalar_text(value).ok_or_else(|| {
            ConfigError::invalid(path, format!("key '{}' needs a scalar value", key))
        })?;

        if !rewrite_existing(&mut lines, section, name, &value) {
            insert_new(&mut lines, section, name, &value);
        }
    }

    let mut out = lines.join(newline);
    if !out.is_empty() {
        out.push_str(newline);
    }
    Ok(out)
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#') || t.starts_with(';') || t.starts_with("--") || t.starts_with("//")
}

fn section_header(line: &str) -> Option<&str> {
    let t = line.trim();
    if t.starts_with('[') && t.ends_with(']') && t.len() >= 2 {
        Some(t[1..t.len() - 1].trim())
    } else {
        None
    }
}

fn line_key(line: &str) -> Option<&str> {
    if is_comment(line) || section_header(line).is_some() {
        return None;
    }
    line.find('=').map(|eq| line[..eq].trim())
}

/// 값 뒤 인라인 주석(` --`, ` ;`, ` #`)의 시작 위치 (앞 공백 포함).
/// 따옴표로 시작한 토큰 안의 기호는 주석이 아님.
fn inline_comment(value: &str) -> Option<usize> {
    let bytes = value.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if (b == b'"' || b == b'\'') && (i == 0 || bytes[i - 1].is_ascii_whitespace()) => {
                quote = Some(b)
            }
            None if b == b' ' || b == b'\t' => {
                let rest = value[i..].trim_start();
                let value_before = !value[..i].trim().is_empty();
                if value_before
                    && (rest.starts_with("--") || rest.starts_with(';') || rest.starts_with('#'))
                {
                    return Some(i);
                }
            }
            None => {}
        }
    }
    None
}

/// 같은 섹션의 모든 일치 라인을 재작성. 하나라도 있었으면 true.
fn rewrite_existing(lines: &mut [String], section: Option<&str>, name: &str, value: &str) -> bool {
    let mut current: Option<String> = None;
    let mut found = false;

    for line in lines.iter_mut() {
        if let Some(header) = section_header(line) {
            current = Some(header.to_string());
            continue;
        }
        if current.as_deref() != section || line_key(line) != Some(name) {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let after = &line[eq + 1..];
            let ws = after.len() - after.trim_start().len();
            let comment = inline_comment(after).map(|at| &after[at..]).unwrap_or("");
            *line = format!("{}{}{}{}", &line[..eq + 1], &after[..ws], value, comment);
            found = true;
        }
    }
    found
}

fn insert_new(lines: &mut Vec<String>, section: Option<&str>, name: &str, value: &str) {
    let entry = format!("{} = {}", name, value);

    let (start, end) = match section {
        None => {
            let end = lines
                .iter()
                .position(|l| section_header(l).is_some())
                .unwrap_or(lines.len());
            (0, end)
        }
        Some(wanted) => {
            let header = lines
                .iter()
                .position(|l| section_header(l) == Some(wanted));
            match header {
                Some(idx) => {
                    let end = lines[idx + 1..]
                        .iter()
                        .position(|l| section_header(l).is_some())
                        .map(|p| idx + 1 + p)
                        .unwrap_or(lines.len());
                    (idx + 1, end)
                }
                None => {
                    // 섹션 자체가 없으면 파일 끝에 새로 만듦
                    if lines.last().map(|l| !l.trim().is_empty()).unwrap_or(false) {
                        lines.push(String::new());
                    }
                    lines.push(format!("[{}]", wanted));
                    lines.push(entry);
                    return;
                }
            }
        }
    };

    // 섹션의 마지막 비어있지 않은 라인 바로 뒤
    let insert_at = lines[start..end]
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|p| start + p + 1)
        .unwrap_or(start);
    lines.insert(insert_at, entry);
}

/// 섹션 → (키 → 값). 첫 섹션 헤더 이전의 전역 키는 `""` 섹션에 들어갑니다.
/// 같은 키가 여러 번 나오면 마지막 값.
pub fn read_sections(text: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current = String::new();
    for line in text.lines() {
        if let Some(header) = section_header(line) {
            current = header.to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let (Some(key), Some(eq)) = (line_key(line), line.find('=')) {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), {
                    let value = &line[eq + 1..];
                    let end = inline_comment(value).unwrap_or(value.len());
                    value[..end].trim().to_string()
                });
        }
    }
    sections
}
