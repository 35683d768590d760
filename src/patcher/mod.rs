//! 네이티브 설정 파일 패처
//!
//! 익스텐션이 관리하는 외부 프로그램의 설정 파일(INI/`key = value`, JSON, TOML,
//! DCS Lua 테이블, 익스텐션 전용 Lua/JSON)을 선언적 옵션으로 갱신합니다.
//!
//! - 관리하지 않는 키, 주석, 순서는 그대로 보존합니다.
//! - 같은 패치를 두 번 적용해도 결과 바이트가 같습니다 (멱등).
//! - 내용이 바뀌지 않으면 파일을 다시 쓰지 않습니다.
//! - 익스텐션이 단독 소유한 파일(`JsonOwned`, `LuaOwned`)은 패치 대신 통째로 재생성합니다.

mod keyvalue;
mod lua;
mod structured;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;

pub use keyvalue::read_sections;
pub use lua::{parse_lua_assignment, to_lua_table};

/// 설정 파일 읽기/쓰기/파싱 에러
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot parse {}: {reason}", .path.display())]
    Unparseable { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid patch for {}: {reason}", .path.display())]
    InvalidPatch { path: PathBuf, reason: String },
}

impl ConfigError {
    pub(crate) fn unparseable(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Unparseable {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(path: &Path, reason: impl fmt::Display) -> Self {
        Self::InvalidPatch {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Dotted key path: `"Server Settings.SERVER_PORT"` → `["Server Settings", "SERVER_PORT"]`.
/// Use [`KeyPath::new`] when a segment itself contains dots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(|s| s.to_string()).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for KeyPath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// 대상 파일 형식
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchFormat {
    /// `key = value` 라인 형식 (INI 섹션 지원)
    KeyValue,
    /// JSON — 키 경로 단위 병합
    Json,
    /// TOML — 키 경로 단위 병합, 서식 보존
    Toml,
    /// 익스텐션이 단독 소유하는 JSON — 매번 재생성
    JsonOwned,
    /// DCS Lua 테이블 대입문 (`options = {...}`) — 키 경로 단위 병합, 서식은 정규화
    Lua { assignment: String },
    /// 익스텐션이 단독 소유하는 Lua 테이블 대입문 (`<assignment> = {...}`) — 매번 재생성
    LuaOwned { assignment: String },
}

impl FromStr for PatchFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyvalue" | "key-value" | "ini" | "cfg" => Ok(Self::KeyValue),
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            "json-owned" => Ok(Self::JsonOwned),
            other => Err(format!("unknown config format '{}'", other)),
        }
    }
}

/// [`ConfigPatch::apply`] 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// 이미 원하는 상태 — 파일을 건드리지 않음
    Unchanged,
    /// 기존 파일을 갱신함
    Updated,
    /// 파일이 없어서 새로 만듦
    Created,
}

/// 순서가 있는 (키 경로, 값) 목록 + 대상 파일 위치/형식
#[derive(Debug, Clone)]
pub struct ConfigPatch {
    pub target: PathBuf,
    pub format: PatchFormat,
    entries: Vec<(KeyPath, Value)>,
}

impl ConfigPatch {
    pub fn new(target: impl Into<PathBuf>, format: PatchFormat) -> Self {
        Self {
            target: target.into(),
            format,
            entries: Vec::new(),
        }
    }

    /// Builder-style [`push`](Self::push).
    pub fn set(mut self, key: impl Into<KeyPath>, value: impl Into<Value>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<KeyPath>, value: impl Into<Value>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn entries(&self) -> &[(KeyPath, Value)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 기존 내용(`None`이면 파일 없음)에 패치를 적용한 결과 텍스트. 파일 I/O 없음.
    pub fn render(&self, existing: Option<&str>) -> Result<String, ConfigError> {
        for (key, _) in &self.entries {
            if key.segments().is_empty() || key.segments().iter().any(|s| s.is_empty()) {
                return Err(ConfigError::invalid(
                    &self.target,
                    format!("empty key segment in '{}'", key),
                ));
            }
        }

        match &self.format {
            PatchFormat::KeyValue => keyvalue::render(existing, &self.entries, &self.target),
            PatchFormat::Json => structured::render_json(existing, &self.entries, &self.target),
            PatchFormat::Toml => structured::render_toml(existing, &self.entries, &self.target),
            PatchFormat::JsonOwned => structured::render_json(None, &self.entries, &self.target),
            PatchFormat::Lua { assignment } => {
                lua::render_merged(assignment, existing, &self.entries, &self.target)
            }
            PatchFormat::LuaOwned { assignment } => {
                lua::render_owned(assignment, &self.entries, &self.target)
            }
        }
    }

    /// 파일을 읽고 패치를 적용해 내용이 달라졌을 때만 다시 씁니다.
    pub fn apply(&self) -> Result<PatchOutcome, ConfigError> {
        let existing = match std::fs::read_to_string(&self.target) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ConfigError::Io {
                    path: self.target.clone(),
                    source: e,
                })
            }
        };

        let rendered = self.render(existing.as_deref())?;
        if existing.as_deref() == Some(rendered.as_str()) {
            tracing::debug!("{} already up to date", self.target.display());
            return Ok(PatchOutcome::Unchanged);
        }

        crate::utils::write_atomic(&self.target, rendered.as_bytes()).map_err(|e| {
            ConfigError::Io {
                path: self.target.clone(),
                source: e,
            }
        })?;

        let outcome = if existing.is_some() {
            PatchOutcome::Updated
        } else {
            PatchOutcome::Created
        };
        tracing::info!("{} {:?} ({} key(s))", self.target.display(), outcome, self.entries.len());
        Ok(outcome)
    }
}

/// `apply(artifact, format, patch)` 형태의 진입점
pub fn apply(patch: &ConfigPatch) -> Result<PatchOutcome, ConfigError> {
    patch.apply()
}

/// 스칼라 JSON 값을 설정 파일 텍스트로 (`"abc"` → `abc`, `true` → `true`)
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}
