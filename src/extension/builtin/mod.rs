//! 기본 제공 익스텐션
//!
//! | 이름      | 종류           | 스코프        |
//! |-----------|----------------|---------------|
//! | SRS       | process-backed | instance      |
//! | LotAtc    | passive        | instance      |
//! | Tacview   | passive        | instance      |
//! | VoiceChat | passive        | instance      |
//! | Olympus   | process-backed | instance      |
//! | Lardoon   | process-backed | node/instance |
//! | Sneaker   | process-backed | node/instance |
//! | Program   | process-backed | node/instance |

pub mod lardoon;
pub mod lotatc;
pub mod olympus;
pub mod program;
pub mod sneaker;
pub mod srs;
pub mod tacview;
pub mod voicechat;

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::{ExtensionContext, ExtensionRegistry, Options, RegistryError};
use crate::supervisor::process::ProcessSpec;

pub fn register_all(registry: &mut ExtensionRegistry) {
    registry.register("SRS", |spec, ctx| Ok(Box::new(srs::Srs::new(spec, ctx)?)));
    registry.register("LotAtc", |spec, ctx| Ok(Box::new(lotatc::LotAtc::new(spec, ctx)?)));
    registry.register("Tacview", |spec, ctx| Ok(Box::new(tacview::Tacview::new(spec, ctx)?)));
    registry.register("Olympus", |spec, ctx| Ok(Box::new(olympus::Olympus::new(spec, ctx)?)));
    registry.register("Lardoon", |spec, ctx| Ok(Box::new(lardoon::Lardoon::new(spec, ctx)?)));
    registry.register("Program", |spec, ctx| Ok(Box::new(program::Program::new(spec, ctx)?)));
    registry.register("VoiceChat", |spec, ctx| Ok(Box::new(voicechat::VoiceChat::new(spec, ctx)?)));
    registry.register("Sneaker", |spec, ctx| Ok(Box::new(sneaker::Sneaker::new(spec, ctx)?)));
}

/// 인스턴스 스코프 전용 익스텐션의 홈 디렉토리
pub(crate) fn instance_home(ctx: &ExtensionContext, extension: &str) -> Result<PathBuf, RegistryError> {
    ctx.home()
        .cloned()
        .ok_or_else(|| RegistryError::invalid(extension, "scope", "must be configured per instance"))
}

/// 클라이언트에게 보여줄 호스트: `host` 옵션 또는 노드 public IP
pub(crate) fn display_host(options: &Options, ctx: &ExtensionContext) -> String {
    options
        .get_str("host")
        .map(str::to_string)
        .unwrap_or_else(|| ctx.node.public_ip.clone())
}

/// 실행 파일 이름에 플랫폼 확장자 붙이기 (`node` → `node.exe`)
pub(crate) fn executable_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

/// 공통 프로세스 스펙: 로그 버퍼 크기, debug 시 출력 echo
pub(crate) fn process_spec(
    label: &str,
    program: impl Into<PathBuf>,
    options: &Options,
    ctx: &ExtensionContext,
) -> ProcessSpec {
    ProcessSpec::new(label, program)
        .buffer_lines(ctx.log_buffer_lines)
        .echo(options.debug())
}

/// 버전 조회 방법: `version` 옵션이 우선, 없으면 `version_args`로 실행해서 출력에서 추출
#[derive(Debug, Clone, Default)]
pub(crate) struct VersionProbe {
    explicit: Option<String>,
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl VersionProbe {
    pub fn from_options(options: &Options, program: &Path) -> Self {
        let args = options.get_str_list("version_args");
        Self {
            explicit: options.get_str("version").map(str::to_string),
            program: (!args.is_empty()).then(|| program.to_path_buf()),
            args,
        }
    }

    pub async fn resolve(&self) -> String {
        if let Some(v) = &self.explicit {
            return v.clone();
        }
        let Some(program) = &self.program else {
            return String::new();
        };

        let mut cmd = Command::new(program);
        cmd.args(&self.args).stdin(std::process::Stdio::null()).kill_on_drop(true);
        crate::utils::apply_creation_flags(&mut cmd);
        match cmd.output().await {
            Ok(out) => {
                let text = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
                crate::utils::extract_version(&text).unwrap_or_default()
            }
            Err(e) => {
                tracing::debug!("Version probe of {} failed: {}", program.display(), e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_explicit_version_wins() {
        let opts = Options::from(json!({"version": "2.1.0", "version_args": ["--version"]}));
        let probe = VersionProbe::from_options(&opts, Path::new("/does/not/exist"));
        assert_eq!(probe.resolve().await, "2.1.0");
    }

    #[tokio::test]
    async fn test_no_probe_configured_is_empty() {
        let probe = VersionProbe::from_options(&Options::new(), Path::new("/bin/true"));
        assert_eq!(probe.resolve().await, "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_parses_output() {
        let opts = Options::from(json!({"version_args": ["-c", "echo 'Lardoon v1.4.2 (build 7)'"]}));
        let probe = VersionProbe::from_options(&opts, Path::new("/bin/sh"));
        assert_eq!(probe.resolve().await, "1.4.2");
    }
}
