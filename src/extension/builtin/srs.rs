//! DCS-SimpleRadio Standalone 서버
//!
//! - prepare: SRS.cfg 패치, 포트 점유, 게임 쪽 자동 연결 훅 관리
//! - startup: `SR-Server.exe -cfg=<config>` 실행 (`autostart = false`면 관찰만)
//! - schedule: `autoupdate` 시 5분마다 최신 릴리스 확인

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{display_host, executable_name, instance_home, process_spec, VersionProbe};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Launcher, Options,
    PortRegistry, RegistryError, ScheduledJob, ScheduledWork, StatusField,
};
use crate::patcher::{self, ConfigError, ConfigPatch, KeyPath, PatchFormat, PatchOutcome};
use crate::supervisor::process::ProcessSpec;

pub const DEFAULT_PORT: u16 = 5002;
pub const LATEST_RELEASE_URL: &str =
    "https://github.com/ciribob/DCS-SimpleRadioStandalone/releases/latest";
const AUTOCONNECT_HOOK: &str = "Scripts/Hooks/DCS-SRS-AutoConnectGameGUI.lua";
const UPDATE_INTERVAL: Duration = Duration::from_secs(300);

const SERVER_SETTINGS: &str = "Server Settings";
const GENERAL_SETTINGS: &str = "General Settings";
const AWACS_SETTINGS: &str = "External AWACS Mode Settings";

type Sections = BTreeMap<String, BTreeMap<String, String>>;

pub struct Srs {
    owner: String,
    ports: Arc<PortRegistry>,
    options: Options,
    config_path: PathBuf,
    home: PathBuf,
    installation: PathBuf,
    executable: PathBuf,
    host: String,
    autostart: bool,
    spec_template: ProcessSpec,
    version: VersionProbe,
    launcher: Launcher,
    /// 마지막 prepare 시점의 SRS.cfg 내용
    locals: Sections,
}

impl Srs {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = spec.options.clone();
        let config_path = options.require_path("SRS", "config")?;
        options.port("SRS", "port", DEFAULT_PORT)?;
        let home = instance_home(ctx, "SRS")?;

        let installation = options
            .get_path("installation")
            .unwrap_or_else(|| crate::utils::expand_path("%ProgramFiles%/DCS-SimpleRadio-Standalone"));
        let executable = options
            .get_path("executable")
            .unwrap_or_else(|| installation.join(executable_name("SR-Server")));

        let mut template = process_spec("SRS", &executable, &options, ctx)
            .arg(format!("-cfg={}", config_path.display()));
        if installation.is_dir() {
            template = template.cwd(&installation);
        }

        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            host: display_host(&options, ctx),
            autostart: options.get_bool("autostart", true),
            version: VersionProbe::from_options(&options, &executable),
            launcher: Launcher::new(format!("{}:SRS", ctx.owner())),
            spec_template: template,
            config_path,
            home,
            installation,
            executable,
            options,
            locals: Sections::new(),
        })
    }

    /// 설정 옵션 → SRS.cfg 패치
    fn config_patch(&self) -> ConfigPatch {
        let mut patch = ConfigPatch::new(&self.config_path, PatchFormat::KeyValue);
        if let Some(port) = self.options.get_u16("port") {
            patch.push(KeyPath::new([SERVER_SETTINGS, "SERVER_PORT"]), port);
        }
        if let Some(awacs) = self.options.get("awacs").and_then(|v| v.as_bool()) {
            patch.push(KeyPath::new([GENERAL_SETTINGS, "EXTERNAL_AWACS_MODE"]), awacs);
        }
        for (key, option) in [
            ("EXTERNAL_AWACS_MODE_BLUE_PASSWORD", "blue_password"),
            ("EXTERNAL_AWACS_MODE_RED_PASSWORD", "red_password"),
        ] {
            if let Some(password) = self.options.get_str(option) {
                patch.push(KeyPath::new([AWACS_SETTINGS, key]), password);
            }
        }
        patch
    }

    /// 실제 적용될 포트: 옵션 → SRS.cfg → 기본값
    pub fn port(&self) -> u16 {
        self.options
            .get_u16("port")
            .or_else(|| self.local(SERVER_SETTINGS, "SERVER_PORT").and_then(|p| p.parse().ok()))
            .unwrap_or(DEFAULT_PORT)
    }

    fn local(&self, section: &str, key: &str) -> Option<&str> {
        self.locals.get(section).and_then(|s| s.get(key)).map(String::as_str)
    }

    fn hook_path(&self) -> PathBuf {
        self.home.join(AUTOCONNECT_HOOK)
    }

    fn enable_autoconnect(&self) -> Result<(), ExtensionError> {
        let hook = self.hook_path();
        let existing = match std::fs::read_to_string(&hook) {
            Ok(text) => text,
            Err(_) => {
                // SRS 설치본에 포함된 훅을 처음 한 번 복사
                let bundled = self.installation.join(AUTOCONNECT_HOOK);
                match std::fs::read_to_string(&bundled) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(
                            "[{}] SRS autoconnect hook not found in {}, skipping",
                            self.owner,
                            bundled.display()
                        );
                        return Ok(());
                    }
                }
            }
        };

        let patch = ConfigPatch::new(&hook, PatchFormat::KeyValue)
            .set(KeyPath::new(["SRSAuto.SERVER_SRS_HOST_AUTO"]), "false")
            .set(KeyPath::new(["SRSAuto.SERVER_SRS_PORT"]), format!("\"{}\"", self.port()))
            .set(KeyPath::new(["SRSAuto.SERVER_SRS_HOST"]), format!("\"{}\"", self.host));
        let rendered = patch.render(Some(&existing))?;

        let on_disk = std::fs::read_to_string(&hook).ok();
        if on_disk.as_deref() == Some(rendered.as_str()) {
            return Ok(());
        }
        if on_disk.is_some() {
            backup(&hook)?;
        }
        crate::utils::write_atomic(&hook, rendered.as_bytes()).map_err(|e| ConfigError::Io {
            path: hook.clone(),
            source: e,
        })?;
        tracing::info!("[{}] SRS autoconnect enabled ({}:{})", self.owner, self.host, self.port());
        Ok(())
    }

    fn disable_autoconnect(&self) -> Result<(), ExtensionError> {
        let hook = self.hook_path();
        if !hook.exists() {
            return Ok(());
        }
        backup(&hook)?;
        std::fs::remove_file(&hook).map_err(|e| ConfigError::Io {
            path: hook.clone(),
            source: e,
        })?;
        tracing::info!("[{}] SRS autoconnect disabled", self.owner);
        Ok(())
    }
}

fn backup(path: &Path) -> Result<(), ConfigError> {
    let mut bak = path.as_os_str().to_owned();
    bak.push(".bak");
    std::fs::copy(path, &bak).map(|_| ()).map_err(|e| ConfigError::Io {
        path: PathBuf::from(bak),
        source: e,
    })
}

#[async_trait]
impl Extension for Srs {
    fn name(&self) -> &str {
        "SRS"
    }

    fn kind(&self) -> ExtensionKind {
        if self.autostart {
            ExtensionKind::ProcessBacked
        } else {
            ExtensionKind::Passive
        }
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        if !self.config_path.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "SRS config {} not found",
                self.config_path.display()
            )));
        }

        let patch = self.config_patch();
        if !patch.is_empty() && patch.apply()? != PatchOutcome::Unchanged {
            tracing::info!("[{}] {} updated", self.owner, self.config_path.display());
        }
        let text = std::fs::read_to_string(&self.config_path).map_err(|e| ConfigError::Io {
            path: self.config_path.clone(),
            source: e,
        })?;
        self.locals = patcher::read_sections(&text);

        self.ports.claim("SRS", self.port(), &self.owner)?;

        if self.options.get_bool("autoconnect", true) {
            self.enable_autoconnect()
        } else {
            self.disable_autoconnect()
        }
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        if !self.autostart {
            return Ok(());
        }
        if !self.executable.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "SRS executable {} not found",
                self.executable.display()
            )));
        }
        let marker = self.config_path.to_string_lossy().to_string();
        let pid = self.launcher.launch(&self.spec_template, Some(&marker)).await?;
        tracing::info!("[{}] SRS started on port {} (pid: {})", self.owner, self.port(), pid);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), ExtensionError> {
        if self.options.get_bool("no_shutdown", false) {
            self.launcher.detach();
            return Ok(());
        }
        self.launcher.stop(grace).await
    }

    fn is_running(&self) -> bool {
        !self.autostart || self.launcher.is_alive()
    }

    async fn version(&self) -> String {
        self.version.resolve().await
    }

    fn render(&self) -> Vec<StatusField> {
        let mut fields = vec![StatusField::new("SRS", format!("{}:{}", self.host, self.port()))];
        let awacs = self.local(GENERAL_SETTINGS, "EXTERNAL_AWACS_MODE") == Some("true");
        if self.options.get_bool("show_passwords", true) && awacs {
            let blue = self.local(AWACS_SETTINGS, "EXTERNAL_AWACS_MODE_BLUE_PASSWORD").unwrap_or("");
            let red = self.local(AWACS_SETTINGS, "EXTERNAL_AWACS_MODE_RED_PASSWORD").unwrap_or("");
            if !blue.is_empty() || !red.is_empty() {
                fields.push(StatusField::new("Blue Password", blue));
                fields.push(StatusField::new("Red Password", red));
            }
        }
        fields
    }

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        if !self.options.get_bool("autoupdate", false) {
            return None;
        }
        Some(ScheduledWork {
            interval: UPDATE_INTERVAL,
            budget: None,
            job: Arc::new(SrsUpdate {
                owner: self.owner.clone(),
                installation: self.installation.clone(),
                version: self.version.clone(),
            }),
        })
    }

    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }
}

/// 최신 릴리스 태그가 설치 버전과 다르면 번들 업데이터 실행
struct SrsUpdate {
    owner: String,
    installation: PathBuf,
    version: VersionProbe,
}

#[async_trait]
impl ScheduledJob for SrsUpdate {
    async fn run(&self) -> anyhow::Result<()> {
        let installed = self.version.resolve().await;
        if installed.is_empty() {
            tracing::debug!("[{}] SRS version unknown, skipping update check", self.owner);
            return Ok(());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("extvisor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        // /releases/latest → /releases/tag/<version> 리다이렉트
        let response = client.get(LATEST_RELEASE_URL).send().await?;
        let tag = response
            .url()
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
            .unwrap_or_default();
        let Some(latest) = crate::utils::extract_version(&tag) else {
            anyhow::bail!("no release tag in {}", response.url());
        };
        if latest == installed {
            return Ok(());
        }

        tracing::info!("[{}] SRS update available: {} → {}", self.owner, installed, latest);
        let updater = self.installation.join(executable_name("SRS-AutoUpdater"));
        let mut cmd = tokio::process::Command::new(&updater);
        cmd.args(["-server", "-autoupdate"])
            .arg(format!("-path={}", self.installation.display()))
            .current_dir(&self.installation);
        crate::utils::apply_creation_flags(&mut cmd);
        let status = cmd.status().await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", updater.display(), status);
        }
        Ok(())
    }
}
