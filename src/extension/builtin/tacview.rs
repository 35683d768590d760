//! Tacview (passive)
//!
//! prepare에서 설정된 `tacview*` 옵션을 게임의 `Config/options.lua`
//! (`plugins.Tacview`)에 써 넣고, 텔레메트리/원격 제어 포트를 점유합니다.
//! 서버 로그(`Logs/dcs.log`)를 따라가며 저장된 녹화 파일을 `target` 디렉토리로 복사합니다.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::{display_host, instance_home};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Options,
    PortRegistry, RegistryError, ScheduledJob, ScheduledWork, StatusField,
};
use crate::patcher::{ConfigError, ConfigPatch, KeyPath, PatchFormat, PatchOutcome};

pub const DEFAULT_TELEMETRY_PORT: u16 = 42674;
pub const DEFAULT_REMOTE_CONTROL_PORT: u16 = 42675;

const PORT_KEYS: [&str; 2] = ["tacviewRealTimeTelemetryPort", "tacviewRemoteControlPort"];
const PASSWORD_KEYS: [&str; 2] = ["tacviewRealTimeTelemetryPassword", "tacviewRemoteControlPassword"];

fn saved_recording() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"TACVIEW\.DLL \(Main\): Successfully saved (?P<filename>.*)")
            .expect("static regex")
    })
}

/// Tacview 옵션 포트는 숫자 또는 문자열(`"42674"`)
fn tacview_port(options: &Options, key: &str, default: u16) -> Result<u16, RegistryError> {
    match options.get(key) {
        None => Ok(default),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| RegistryError::invalid("Tacview", key, "must be a port number")),
        Some(_) => options.port("Tacview", key, default),
    }
}

pub struct Tacview {
    owner: String,
    ports: Arc<PortRegistry>,
    options: Options,
    /// `options` 위에 덮어쓴 options.lua의 `plugins.Tacview` (prepare 이후)
    settings: Options,
    /// 게임 옵션 파일, 노드 스코프에서 `options_file`이 없으면 None
    options_file: Option<PathBuf>,
    host: String,
    telemetry_port: u16,
    remote_control_port: u16,
    log_path: PathBuf,
    observing: bool,
    /// 다음에 읽을 로그 바이트 위치
    cursor: Arc<Mutex<u64>>,
}

impl Tacview {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = spec.options.clone();
        let telemetry_port =
            tacview_port(&options, "tacviewRealTimeTelemetryPort", DEFAULT_TELEMETRY_PORT)?;
        let remote_control_port =
            tacview_port(&options, "tacviewRemoteControlPort", DEFAULT_REMOTE_CONTROL_PORT)?;
        let log_path = match options.get_path("log") {
            Some(path) => path,
            None => instance_home(ctx, "Tacview")?.join("Logs").join("dcs.log"),
        };
        let options_file = options
            .get_path("options_file")
            .or_else(|| ctx.home().map(|home| home.join("Config").join("options.lua")));
        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            host: display_host(&options, ctx),
            settings: options.clone(),
            options,
            options_file,
            telemetry_port,
            remote_control_port,
            log_path,
            observing: false,
            cursor: Arc::new(Mutex::new(0)),
        })
    }

    fn playback_delay(&self) -> u64 {
        playback_delay(&self.settings)
    }

    fn remote_control_enabled(&self) -> bool {
        self.settings.get_bool("tacviewRemoteControlEnabled", false)
    }

    fn telemetry_enabled(&self) -> bool {
        self.settings.get_bool("tacviewRealTimeTelemetryEnabled", true)
    }

    /// 설정된 키만 `plugins.Tacview.<key>`로. 포트는 문자열, 지연은 정수로 씀.
    async fn options_patch(&self) -> Result<Option<ConfigPatch>, ExtensionError> {
        let Some(path) = &self.options_file else {
            return Ok(None);
        };
        let key = |name: &str| KeyPath::new(["plugins", "Tacview", name]);
        let mut patch = ConfigPatch::new(path, PatchFormat::Lua { assignment: "options".into() });

        if let Some(dir) = self.options.get_path("tacviewExportPath") {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| ConfigError::Io {
                path: dir.clone(),
                source: e,
            })?;
            patch.push(key("tacviewExportPath"), dir.to_string_lossy().to_string());
        }
        for (name, port) in PORT_KEYS.into_iter().zip([self.telemetry_port, self.remote_control_port]) {
            if self.options.contains(name) {
                patch.push(key(name), port.to_string());
            }
        }
        for name in PASSWORD_KEYS {
            if let Some(text) = self.options.get(name).and_then(crate::patcher::scalar_text) {
                patch.push(key(name), text);
            }
        }
        if self.options.contains("tacviewPlaybackDelay") {
            patch.push(key("tacviewPlaybackDelay"), playback_delay(&self.options));
        }
        Ok((!patch.is_empty()).then_some(patch))
    }

    /// options.lua의 `plugins.Tacview` 테이블. 파일이 없으면 빈 옵션.
    async fn read_plugin_options(&self) -> Result<Options, ExtensionError> {
        let Some(path) = &self.options_file else {
            return Ok(Options::new());
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Options::new()),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.clone(),
                    source: e,
                }
                .into())
            }
        };
        let root = crate::patcher::parse_lua_assignment(&text, "options")
            .map_err(|e| ConfigError::unparseable(path, e))?;
        match root.pointer("/plugins/Tacview") {
            Some(Value::Object(map)) => Ok(Options::from_map(map.clone())),
            _ => Ok(Options::new()),
        }
    }
}

fn playback_delay(options: &Options) -> u64 {
    match options.get("tacviewPlaybackDelay") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl Extension for Tacview {
    fn name(&self) -> &str {
        "Tacview"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Passive
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        if let Some(patch) = self.options_patch().await? {
            if patch.apply()? != PatchOutcome::Unchanged {
                tracing::info!("[{}] {} updated", self.owner, patch.target.display());
            }
        }
        self.settings = self.options.merged_over(&self.read_plugin_options().await?);
        let port = |key: &str, default: u16| {
            tacview_port(&self.settings, key, default).map_err(|e| ExtensionError::failed(e.to_string()))
        };
        let telemetry_port = port(PORT_KEYS[0], DEFAULT_TELEMETRY_PORT)?;
        let remote_control_port = port(PORT_KEYS[1], DEFAULT_REMOTE_CONTROL_PORT)?;
        self.telemetry_port = telemetry_port;
        self.remote_control_port = remote_control_port;

        if self.playback_delay() == 0 {
            tracing::warn!(
                "[{}] tacviewPlaybackDelay is not set, you might see performance issues",
                self.owner
            );
        }
        if self.telemetry_enabled() {
            self.ports.claim("Tacview telemetry", self.telemetry_port, &self.owner)?;
        }
        if self.remote_control_enabled() {
            self.ports
                .claim("Tacview remote control", self.remote_control_port, &self.owner)?;
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        // 이전 세션의 로그는 건너뜀
        let end = tokio::fs::metadata(&self.log_path).await.map(|m| m.len()).unwrap_or(0);
        *self.cursor.lock().await = end;
        self.observing = true;
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
        self.observing = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.observing
    }

    async fn version(&self) -> String {
        self.options.get_str("version").unwrap_or_default().to_string()
    }

    fn render(&self) -> Vec<StatusField> {
        if !self.settings.get_bool("tacviewModuleEnabled", true) {
            return vec![StatusField::new("Tacview", "disabled")];
        }
        let show_passwords = self.options.get_bool("show_passwords", true);
        let mut fields = Vec::new();
        if self.telemetry_enabled() {
            fields.push(StatusField::new(
                "Tacview",
                format!("{}:{}", self.host, self.telemetry_port),
            ));
            match self.settings.get_str("tacviewRealTimeTelemetryPassword") {
                Some(pw) if show_passwords && !pw.is_empty() => {
                    fields.push(StatusField::new("Telemetry Password", pw))
                }
                _ => {}
            }
        }
        if self.remote_control_enabled() {
            fields.push(StatusField::new("Remote Control", self.remote_control_port.to_string()));
            match self.settings.get_str("tacviewRemoteControlPassword") {
                Some(pw) if show_passwords && !pw.is_empty() => {
                    fields.push(StatusField::new("Remote Control Password", pw))
                }
                _ => {}
            }
        }
        let delay = self.playback_delay();
        if delay > 0 {
            fields.push(StatusField::new("Delay", format!("{}s", delay)));
        }
        if fields.is_empty() {
            fields.push(StatusField::new("Tacview", "enabled"));
        }
        fields
    }

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        let target = self.options.get_path("target")?;
        Some(ScheduledWork {
            interval: Duration::from_secs(self.options.get_u64("interval_secs").unwrap_or(5).max(1)),
            budget: None,
            job: Arc::new(RecordingCollector {
                owner: self.owner.clone(),
                log_path: self.log_path.clone(),
                target,
                cursor: self.cursor.clone(),
            }),
        })
    }
}

/// 새 로그 라인에서 저장된 녹화 파일을 찾아 복사
struct RecordingCollector {
    owner: String,
    log_path: PathBuf,
    target: PathBuf,
    cursor: Arc<Mutex<u64>>,
}

impl RecordingCollector {
    /// 커서 이후의 완성된 라인들. 커서는 마지막 개행 뒤로 이동.
    async fn new_lines(&self) -> anyhow::Result<Vec<String>> {
        let mut cursor = self.cursor.lock().await;
        let mut file = match tokio::fs::File::open(&self.log_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *cursor = 0;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < *cursor {
            // 로그가 새로 시작됨
            *cursor = 0;
        }
        file.seek(std::io::SeekFrom::Start(*cursor)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        *cursor += last_newline as u64 + 1;
        Ok(String::from_utf8_lossy(&buf[..last_newline])
            .lines()
            .map(str::to_string)
            .collect())
    }

    async fn collect(&self, recording: &Path) -> anyhow::Result<()> {
        let Some(file_name) = recording.file_name() else {
            anyhow::bail!("no file name in {}", recording.display());
        };
        tokio::fs::create_dir_all(&self.target).await?;
        let dest = self.target.join(file_name);
        tokio::fs::copy(recording, &dest).await?;
        tracing::info!("[{}] Tacview recording copied to {}", self.owner, dest.display());
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for RecordingCollector {
    async fn run(&self) -> anyhow::Result<()> {
        for line in self.new_lines().await? {
            let Some(caps) = saved_recording().captures(&line) else {
                continue;
            };
            let name = caps["filename"].trim().trim_matches(|c: char| c == '"' || c == '\'');
            let recording = PathBuf::from(name);
            if !recording.exists() {
                tracing::warn!("[{}] Tacview recording {} not found", self.owner, name);
                continue;
            }
            if let Err(e) = self.collect(&recording).await {
                tracing::warn!("[{}] Could not copy {}: {}", self.owner, name, e);
            }
        }
        Ok(())
    }
}
