//! Declarative extension options (`[...extensions.<Name>]` tables).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RegistryError;

/// Base keys every extension understands.
pub const BASE_KEYS: [&str; 3] = ["enabled", "debug", "required"];

/// 순서가 보존되는 옵션 맵
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(Map<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// `json!({...})` 객체에서 생성. 객체가 아니면 빈 옵션.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get_u64(key).and_then(|v| u16::try_from(v).ok())
    }

    /// 문자열 배열 (`["--version"]`). 단일 문자열은 한 원소로 취급.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// 환경 변수를 확장한 경로
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_str(key).map(crate::utils::expand_path)
    }

    pub fn enabled(&self) -> bool {
        self.get_bool("enabled", true)
    }

    pub fn debug(&self) -> bool {
        self.get_bool("debug", false)
    }

    pub fn required(&self) -> bool {
        self.get_bool("required", false)
    }

    // ── 생성자 검증용 ──

    pub fn require_str(&self, extension: &str, key: &str) -> Result<&str, RegistryError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Err(RegistryError::missing(extension, key)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(RegistryError::invalid(extension, key, "must not be empty"))
            }
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(RegistryError::invalid(extension, key, "must be a string")),
        }
    }

    pub fn require_path(&self, extension: &str, key: &str) -> Result<PathBuf, RegistryError> {
        self.require_str(extension, key).map(crate::utils::expand_path)
    }

    /// 포트 옵션 — 없으면 `default`, 있으면 1..=65535 범위 검증
    pub fn port(&self, extension: &str, key: &str, default: u16) -> Result<u16, RegistryError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p > 0)
                .ok_or_else(|| RegistryError::invalid(extension, key, "must be a port number")),
        }
    }

    /// Base keys must be booleans when present.
    pub fn validate_base(&self, extension: &str) -> Result<(), RegistryError> {
        for key in BASE_KEYS {
            if let Some(v) = self.0.get(key) {
                if !v.is_boolean() {
                    return Err(RegistryError::invalid(extension, key, "must be true or false"));
                }
            }
        }
        Ok(())
    }

    /// `defaults` 위에 `self`를 덮어쓴 결과. 중첩 테이블은 재귀 병합.
    pub fn merged_over(&self, defaults: &Options) -> Options {
        let mut merged = defaults.0.clone();
        for (k, v) in &self.0 {
            merge_into(&mut merged, k, v);
        }
        Options(merged)
    }

    /// 베이스/표시 전용 키를 뺀 나머지
    pub fn without(&self, keys: &[&str]) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| !BASE_KEYS.contains(&k.as_str()) && !keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn merge_into(map: &mut Map<String, Value>, key: &str, value: &Value) {
    match (map.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_into(existing, k, v);
            }
        }
        _ => {
            map.insert(key.to_string(), value.clone());
        }
    }
}

impl From<Value> for Options {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}
