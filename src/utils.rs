//! Shared utility functions for the extvisor daemon.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Unix timestamp (seconds)
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `%NAME%`, `${NAME}`, `$NAME` 형태의 환경 변수를 확장합니다.
/// 정의되지 않은 변수는 원문 그대로 둡니다.
pub fn expand_vars(input: &str) -> String {
    static VAR_RE: OnceLock<Regex> = OnceLock::new();
    let re = VAR_RE.get_or_init(|| {
        Regex::new(r"%(?P<win>[A-Za-z_][A-Za-z0-9_()]*)%|\$\{(?P<brace>[A-Za-z_][A-Za-z0-9_]*)\}|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)")
            .expect("static regex")
    });

    re.replace_all(input, |caps: &regex::Captures| {
        let name = caps
            .name("win")
            .or_else(|| caps.name("brace"))
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// 환경 변수를 확장한 경로
pub fn expand_path(input: &str) -> PathBuf {
    PathBuf::from(expand_vars(input))
}

/// 출력 텍스트에서 첫 번째 점 구분 버전 번호를 찾습니다 (예: "Lardoon v1.2.3" → "1.2.3").
pub fn extract_version(text: &str) -> Option<String> {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)+").expect("static regex"));
    re.find(text).map(|m| m.as_str().to_string())
}

/// Write `content` to `path` through a temp file in the same directory, so readers
/// never observe a half-written artifact. Parent directories are created on demand.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
