//! Daemon configuration (`config/extvisor.toml`, or `EXTVISOR_CONFIG`).
//!
//! ```toml
//! [supervisor]
//! monitor_interval_secs = 30
//! max_restarts = 3
//!
//! [[nodes]]
//! id = "node1"
//! public_ip = "203.0.113.7"
//!
//! [nodes.extensions.Lardoon]
//! cmd = "C:\\lardoon\\lardoon.exe"
//! bind = "0.0.0.0:3113"
//! tacview_dir = "%USERPROFILE%\\Documents\\Tacview"
//!
//! [nodes.defaults.SRS]
//! installation = "%ProgramFiles%\\DCS-SimpleRadio-Standalone"
//!
//! [[nodes.instances]]
//! id = "DCS.server"
//! home = "%USERPROFILE%\\Saved Games\\DCS.server"
//!
//! [nodes.instances.extensions.SRS]
//! config = "%USERPROFILE%\\Saved Games\\DCS.server\\Config\\SRS.cfg"
//! port = 5002
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::extension::builtin::sneaker::servers_from_tacview;
use crate::extension::{ExtensionSpec, InstanceInfo, NodeInfo, Options, Scope};
use crate::supervisor::restart::RestartPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/extvisor.toml";
pub const CONFIG_ENV: &str = "EXTVISOR_CONFIG";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub supervisor: SupervisorSettings,
    pub nodes: Vec<NodeConfig>,
}

/// `[supervisor]` — 모니터링/재시작/스케줄러 튜닝
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorSettings {
    pub monitor_interval_secs: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub shutdown_grace_secs: u64,
    pub task_budget_secs: u64,
    pub version_probe_secs: u64,
    pub log_buffer_lines: usize,
    pub show_disabled: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 30,
            max_restarts: 3,
            restart_window_secs: 300,
            shutdown_grace_secs: 10,
            task_budget_secs: 60,
            version_probe_secs: 5,
            log_buffer_lines: 2_000,
            show_disabled: false,
        }
    }
}

impl SupervisorSettings {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            window: Duration::from_secs(self.restart_window_secs),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn task_budget(&self) -> Duration {
        Duration::from_secs(self.task_budget_secs.max(1))
    }

    pub fn version_probe(&self) -> Duration {
        Duration::from_secs(self.version_probe_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default = "default_public_ip")]
    pub public_ip: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// 노드 스코프 익스텐션 (선언 순서 유지)
    #[serde(default)]
    pub extensions: Map<String, Value>,
    /// 모든 인스턴스의 같은 이름 익스텐션 옵션 밑에 깔리는 기본값
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub home: String,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

fn default_public_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

impl GlobalConfig {
    /// `EXTVISOR_CONFIG` 또는 `config/extvisor.toml`
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, running without nodes", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg = Self::from_toml(&text).with_context(|| format!("loading {}", path.display()))?;
        tracing::info!(
            "Loaded {} node(s), {} instance(s) from {}",
            cfg.nodes.len(),
            cfg.nodes.iter().map(|n| n.instances.len()).sum::<usize>(),
            path.display()
        );
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).context("invalid TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Node ids and instance ids must be unique across the fleet.
    fn validate(&self) -> Result<()> {
        let mut nodes = HashSet::new();
        let mut instances = HashSet::new();
        for node in &self.nodes {
            if !nodes.insert(node.id.as_str()) {
                anyhow::bail!("duplicate node id '{}'", node.id);
            }
            for instance in &node.instances {
                if !instances.insert(instance.id.as_str()) {
                    anyhow::bail!("duplicate instance id '{}'", instance.id);
                }
            }
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            public_ip: self.public_ip.clone(),
            listen_address: self.listen_address.clone(),
        }
    }

    /// 노드 Sneaker에 `servers`/`config`가 없으면 인스턴스들의 Tacview로 채움
    pub fn node_specs(&self) -> Vec<ExtensionSpec> {
        self.extensions
            .iter()
            .map(|(name, value)| {
                let mut options = to_options(value);
                if name.eq_ignore_ascii_case("Sneaker")
                    && !options.contains("servers")
                    && !options.contains("config")
                {
                    options.insert("servers", self.tacview_servers());
                }
                ExtensionSpec::new(name.clone(), Scope::Node, self.id.clone(), options)
            })
            .collect()
    }

    fn tacview_servers(&self) -> Value {
        let tacviews: Vec<(String, Options)> = self
            .instances
            .iter()
            .filter_map(|instance| {
                self.instance_specs(instance)
                    .into_iter()
                    .find(|spec| spec.name.eq_ignore_ascii_case("Tacview"))
                    .map(|spec| (instance.info().name, spec.options))
            })
            .collect();
        servers_from_tacview(tacviews.iter().map(|(name, options)| (name.as_str(), options)))
    }

    /// 인스턴스 옵션을 `[nodes.defaults.<Name>]` 위에 병합한 스펙
    pub fn instance_specs(&self, instance: &InstanceConfig) -> Vec<ExtensionSpec> {
        instance
            .extensions
            .iter()
            .map(|(name, value)| {
                let own = to_options(value);
                let options = match self.defaults.get(name) {
                    Some(defaults) => own.merged_over(&to_options(defaults)),
                    None => own,
                };
                ExtensionSpec::new(name.clone(), Scope::Instance, instance.id.clone(), options)
            })
            .collect()
    }
}

impl InstanceConfig {
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            home: crate::utils::expand_path(&self.home),
        }
    }

    pub fn home(&self) -> PathBuf {
        crate::utils::expand_path(&self.home)
    }
}

/// `SRS = false` 같은 축약형은 `{ enabled = false }`
fn to_options(value: &Value) -> Options {
    match value {
        Value::Object(map) => Options::from_map(map.clone()),
        Value::Bool(enabled) => {
            let mut opts = Options::new();
            opts.insert("enabled", *enabled);
            opts
        }
        _ => Options::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[supervisor]
monitor_interval_secs = 5
max_restarts = 2

[[nodes]]
id = "node1"
public_ip = "203.0.113.7"

[nodes.extensions.Lardoon]
cmd = "/opt/lardoon"
bind = "0.0.0.0:3113"
tacview_dir = "/srv/tacview"

[nodes.defaults.SRS]
installation = "/opt/srs"
autoupdate = false

[[nodes.instances]]
id = "DCS.server"
home = "/srv/dcs/DCS.server"

[nodes.instances.extensions.SRS]
config = "/srv/dcs/DCS.server/Config/SRS.cfg"
port = 5002
autoupdate = true

[nodes.instances.extensions.LotAtc]
port = 10310

[[nodes.instances]]
id = "DCS.training"
name = "Training"
home = "/srv/dcs/DCS.training"

[nodes.instances.extensions]
Tacview = false
"#;

    #[test]
    fn test_defaults_when_section_missing() {
        let cfg = GlobalConfig::from_toml("").unwrap();
        assert_eq!(cfg.supervisor, SupervisorSettings::default());
        assert!(cfg.nodes.is_empty());
        assert_eq!(cfg.supervisor.monitor_interval(), Duration::from_secs(30));
        assert_eq!(cfg.supervisor.restart_policy(), RestartPolicy::default());
    }

    #[test]
    fn test_parse_sample() {
        let cfg = GlobalConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.supervisor.monitor_interval_secs, 5);
        assert_eq!(cfg.supervisor.max_restarts, 2);
        // 나머지는 기본값
        assert_eq!(cfg.supervisor.restart_window_secs, 300);

        let node = &cfg.nodes[0];
        assert_eq!(node.info().listen_address, "0.0.0.0");
        let node_specs = node.node_specs();
        assert_eq!(node_specs.len(), 1);
        assert_eq!(node_specs[0].scope, Scope::Node);
        assert_eq!(node_specs[0].owner_id, "node1");

        let specs = node.instance_specs(&node.instances[0]);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["SRS", "LotAtc"]);
        // 기본값 병합 + 인스턴스 값 우선
        assert_eq!(specs[0].options.get_str("installation"), Some("/opt/srs"));
        assert!(specs[0].options.get_bool("autoupdate", false));

        let training = node.instance_specs(&node.instances[1]);
        assert_eq!(training.len(), 1);
        assert!(!training[0].enabled);
        assert_eq!(node.instances[1].info().name, "Training");
        assert_eq!(node.instances[0].info().name, "DCS.server");
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let text = r#"
[[nodes]]
id = "a"
[[nodes.instances]]
id = "x"
home = "/a"
[[nodes]]
id = "b"
[[nodes.instances]]
id = "x"
home = "/b"
"#;
        let err = GlobalConfig::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("duplicate instance id 'x'"));
    }

    #[test]
    fn test_node_sneaker_follows_instance_tacviews() {
        let text = r#"
[[nodes]]
id = "node1"

[nodes.extensions.Sneaker]
cmd = "/opt/sneaker"
bind = "0.0.0.0:7788"

[nodes.defaults.Tacview]
tacviewRealTimeTelemetryPort = 42674

[[nodes.instances]]
id = "DCS.server"
name = "Main"
home = "/srv/dcs/DCS.server"
[nodes.instances.extensions.Tacview]
tacviewRealTimeTelemetryPort = "42700"

[[nodes.instances]]
id = "DCS.training"
home = "/srv/dcs/DCS.training"
[nodes.instances.extensions]
Tacview = false

[[nodes.instances]]
id = "DCS.event"
home = "/srv/dcs/DCS.event"
[nodes.instances.extensions.Tacview]
"#;
        let cfg = GlobalConfig::from_toml(text).unwrap();
        let specs = cfg.nodes[0].node_specs();
        assert_eq!(
            specs[0].options.get("servers"),
            Some(&serde_json::json!([
                {"name": "Main", "port": 42700},
                {"name": "DCS.event", "port": 42674},
            ]))
        );
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = GlobalConfig::load_from(&tmp.path().join("nope.toml")).unwrap();
        assert!(cfg.nodes.is_empty());
    }
}
