//! Lardoon: Tacview 녹화 웹 뷰어
//!
//! `lardoon serve --bind <addr>`로 서버를 띄우고, `minutes`마다
//! `import -p <tacview_dir>` → `prune --no-dry-run`을 실행합니다.
//! 노드 스코프에 두면 여러 인스턴스가 한 서버를 공유합니다.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{process_spec, VersionProbe};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Launcher,
    PortRegistry, RegistryError, ScheduledJob, ScheduledWork, StatusField,
};
use crate::supervisor::process::ProcessSpec;

const DEFAULT_MINUTES: u64 = 5;

pub struct Lardoon {
    owner: String,
    ports: Arc<PortRegistry>,
    cmd: PathBuf,
    bind: String,
    url: Option<String>,
    import: Arc<LardoonImport>,
    interval: Duration,
    spec_template: ProcessSpec,
    version: VersionProbe,
    launcher: Launcher,
}

/// `host:port` → port
fn bind_port(bind: &str) -> Option<u16> {
    bind.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

impl Lardoon {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = &spec.options;
        let cmd = options.require_path("Lardoon", "cmd")?;
        let bind = options.require_str("Lardoon", "bind")?.to_string();
        if bind_port(&bind).is_none() {
            return Err(RegistryError::invalid("Lardoon", "bind", "must be host:port"));
        }
        let tacview_dir = options.require_path("Lardoon", "tacview_dir")?;
        let minutes = options.get_u64("minutes").unwrap_or(DEFAULT_MINUTES).max(1);

        let spec_template =
            process_spec("Lardoon", &cmd, options, ctx).args(["serve", "--bind", bind.as_str()]);

        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            url: options.get_str("url").map(str::to_string),
            import: Arc::new(LardoonImport {
                owner: ctx.owner(),
                cmd: cmd.clone(),
                tacview_dir,
            }),
            interval: Duration::from_secs(minutes * 60),
            version: VersionProbe::from_options(options, &cmd),
            launcher: Launcher::new(format!("{}:Lardoon", ctx.owner())),
            spec_template,
            cmd,
            bind,
        })
    }
}

#[async_trait]
impl Extension for Lardoon {
    fn name(&self) -> &str {
        "Lardoon"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::ProcessBacked
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        if let Some(port) = bind_port(&self.bind) {
            self.ports.claim("Lardoon", port, &self.owner)?;
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        if !self.cmd.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "Lardoon executable {} not found",
                self.cmd.display()
            )));
        }
        let pid = self.launcher.launch(&self.spec_template, Some(&self.bind)).await?;
        tracing::info!("[{}] Lardoon serving on {} (pid: {})", self.owner, self.bind, pid);
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
            "Lardoon",
            self.url.clone().unwrap_or_else(|| "enabled".to_string()),
        )]
    }

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        Some(ScheduledWork {
            interval: self.interval,
            budget: None,
            job: self.import.clone(),
        })
    }

    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }
}

/// 새 녹화 가져오기 후 정리
struct LardoonImport {
    owner: String,
    cmd: PathBuf,
    tacview_dir: PathBuf,
}

impl LardoonImport {
    async fn run_step(&self, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = tokio::process::Command::new(&self.cmd);
        cmd.args(args).stdin(std::process::Stdio::null()).kill_on_drop(true);
        crate::utils::apply_creation_flags(&mut cmd);
        let out = cmd.output().await?;
        if !out.status.success() {
            tracing::error!(
                "[{}] lardoon {} failed: {}",
                self.owner,
                args[0],
                String::from_utf8_lossy(&out.stderr).trim()
            );
            anyhow::bail!("lardoon {} exited with {}", args[0], out.status);
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for LardoonImport {
    async fn run(&self) -> anyhow::Result<()> {
        let dir = self.tacview_dir.to_string_lossy();
        self.run_step(&["import", "-p", dir.as_ref()]).await?;
        self.run_step(&["prune", "--no-dry-run"]).await?;
        tracing::debug!("[{}] Lardoon import finished", self.owner);
        Ok(())
    }
}
