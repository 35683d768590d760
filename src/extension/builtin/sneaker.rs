//! Sneaker: Tacview 텔레메트리 기반 웹 GCI 레이더
//!
//! `sneaker --bind <addr> --config <sneaker.json>`을 띄웁니다. 보통 노드 스코프에 두고
//! 모든 인스턴스가 한 프로세스를 공유합니다.
//!
//! `config`를 주지 않으면 `sneaker.json`은 익스텐션이 소유하고 prepare마다 `servers`
//! 목록에서 통째로 다시 만듭니다. 노드 설정에서 `servers`를 생략하면 Tacview가 켜진
//! 인스턴스들로 채워지고, 인스턴스 스코프에서는 그 인스턴스의 Tacview 하나가 됩니다.
//!
//! ```toml
//! [nodes.extensions.Sneaker]
//! cmd = "C:/sneaker/sneaker.exe"
//! bind = "0.0.0.0:7788"
//! url = "http://203.0.113.7:7788"
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::tacview::DEFAULT_TELEMETRY_PORT;
use super::{process_spec, VersionProbe};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Launcher, Options,
    PortRegistry, RegistryError, StatusField,
};
use crate::patcher::{ConfigPatch, PatchFormat, PatchOutcome};
use crate::supervisor::process::ProcessSpec;

const DEFAULT_RADAR_REFRESH_RATE: u64 = 5;

pub struct Sneaker {
    owner: String,
    ports: Arc<PortRegistry>,
    cmd: PathBuf,
    bind: String,
    url: Option<String>,
    /// 사용자가 준 설정 파일이면 그대로 쓰고, 아니면 재생성
    config: PathBuf,
    owned: Option<ConfigPatch>,
    spec_template: ProcessSpec,
    version: VersionProbe,
    launcher: Launcher,
}

/// `host:port` → port
fn bind_port(bind: &str) -> Option<u16> {
    bind.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

/// Tacview 포트는 숫자 또는 문자열
fn telemetry_port(value: Option<&Value>) -> Option<u16> {
    match value {
        None => Some(DEFAULT_TELEMETRY_PORT),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(v) => v.as_u64().and_then(|p| u16::try_from(p).ok()),
    }
    .filter(|p| *p > 0)
}

/// 노드 설정의 `servers` 목록 기본값: Tacview가 켜진 인스턴스마다 하나
pub fn servers_from_tacview<'a>(instances: impl IntoIterator<Item = (&'a str, &'a Options)>) -> Value {
    let servers: Vec<Value> = instances
        .into_iter()
        .filter(|(_, tacview)| tacview.enabled() && tacview.get_bool("tacviewRealTimeTelemetryEnabled", true))
        .map(|(name, tacview)| {
            let port = telemetry_port(tacview.get("tacviewRealTimeTelemetryPort"))
                .unwrap_or(DEFAULT_TELEMETRY_PORT);
            json!({"name": name, "port": port})
        })
        .collect();
    Value::Array(servers)
}

/// `sneaker.json`의 `servers` 항목들
fn server_entries(options: &Options, ctx: &ExtensionContext) -> Result<Vec<Value>, RegistryError> {
    let servers = match (options.get("servers"), &ctx.instance, ctx.peer("Tacview")) {
        (Some(Value::Array(items)), _, _) => items.clone(),
        (Some(_), _, _) => return Err(RegistryError::invalid("Sneaker", "servers", "must be a list of tables")),
        (None, Some(instance), Some(tacview)) => {
            match servers_from_tacview([(instance.name.as_str(), tacview)]) {
                Value::Array(items) => items,
                _ => Vec::new(),
            }
        }
        (None, _, _) => Vec::new(),
    };

    // 0.0.0.0은 접속 주소로 쓸 수 없음
    let default_host = match ctx.node.listen_address.as_str() {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };
    let refresh = options.get_u64("radar_refresh_rate").unwrap_or(DEFAULT_RADAR_REFRESH_RATE);
    let friendly = options.get_bool("enable_friendly_ground_units", true);
    let enemy = options.get_bool("enable_enemy_ground_units", true);

    let mut entries = Vec::with_capacity(servers.len());
    for server in servers {
        let Some(name) = server.get("name").and_then(Value::as_str) else {
            return Err(RegistryError::invalid("Sneaker", "servers", "every server needs a name"));
        };
        let port = telemetry_port(server.get("port"))
            .ok_or_else(|| RegistryError::invalid("Sneaker", "servers", "port must be a port number"))?;
        let hostname = server
            .get("hostname")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_host.clone());
        entries.push(json!({
            "name": name,
            "hostname": hostname,
            "port": port,
            "radar_refresh_rate": server.get("radar_refresh_rate").and_then(Value::as_u64).unwrap_or(refresh),
            "enable_friendly_ground_units": server
                .get("enable_friendly_ground_units")
                .and_then(Value::as_bool)
                .unwrap_or(friendly),
            "enable_enemy_ground_units": server
                .get("enable_enemy_ground_units")
                .and_then(Value::as_bool)
                .unwrap_or(enemy),
        }));
    }
    Ok(entries)
}

impl Sneaker {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = &spec.options;
        let cmd = options.require_path("Sneaker", "cmd")?;
        let bind = options.require_str("Sneaker", "bind")?.to_string();
        if bind_port(&bind).is_none() {
            return Err(RegistryError::invalid("Sneaker", "bind", "must be host:port"));
        }

        let (config, owned) = match options.get_path("config") {
            Some(path) => (path, None),
            None => {
                let path = match options.get_path("sneaker_json") {
                    Some(path) => path,
                    None => cmd.with_file_name("sneaker.json"),
                };
                let servers = server_entries(options, ctx)?;
                if servers.is_empty() {
                    tracing::warn!("[{}] Sneaker has no Tacview servers to follow", ctx.owner());
                }
                let patch = ConfigPatch::new(&path, PatchFormat::JsonOwned).set("servers", servers);
                (path, Some(patch))
            }
        };

        let config_arg = config.to_string_lossy().to_string();
        let spec_template = process_spec("Sneaker", &cmd, options, ctx)
            .args(["--bind", bind.as_str(), "--config", config_arg.as_str()]);

        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            url: options.get_str("url").map(str::to_string),
            version: VersionProbe::from_options(options, &cmd),
            launcher: Launcher::new(format!("{}:Sneaker", ctx.owner())),
            spec_template,
            cmd,
            bind,
            config,
            owned,
        })
    }
}

#[async_trait]
impl Extension for Sneaker {
    fn name(&self) -> &str {
        "Sneaker"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::ProcessBacked
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        if let Some(port) = bind_port(&self.bind) {
            self.ports.claim("Sneaker", port, &self.owner)?;
        }
        if let Some(patch) = &self.owned {
            if patch.apply()? != PatchOutcome::Unchanged {
                tracing::info!("[{}] {} regenerated", self.owner, patch.target.display());
            }
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        if !self.cmd.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "Sneaker executable {} not found",
                self.cmd.display()
            )));
        }
        if !self.config.exists() {
            return Err(ExtensionError::failed(format!(
                "Sneaker config {} not found",
                self.config.display()
            )));
        }
        let pid = self.launcher.launch(&self.spec_template, Some(&self.bind)).await?;
        tracing::info!("[{}] Sneaker serving on {} (pid: {})", self.owner, self.bind, pid);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), ExtensionError> {
        self.launcher.stop(grace).await
    }

    fn is_running(&self) -> bool {
        self.launcher.is_alive()
    }

    async fn version(&self) -> String {
        self.version.resolve().await
    }

    fn render(&self) -> Vec<StatusField> {
        vec![StatusField::new(
            "Sneaker",
            self.url.clone().unwrap_or_else(|| "enabled".to_string()),
        )]
    }

    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }
}
