//! Exclusive owner of one extension's child process.

use std::time::Duration;

use crate::process_monitor;
use crate::supervisor::process::{force_kill_pid, LogLine, ProcessError, ProcessHandle, ProcessSpec};

use super::ExtensionError;

/// Holds at most one [`ProcessHandle`]. A second launch while the first child is
/// alive is refused.
#[derive(Debug)]
pub struct Launcher {
    label: String,
    handle: Option<ProcessHandle>,
}

impl Launcher {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            handle: None,
        }
    }

    /// Spawn `spec`. When `stray_marker` is given, any process with the same
    /// executable name whose command line contains the marker is killed first.
    pub async fn launch(
        &mut self,
        spec: &ProcessSpec,
        stray_marker: Option<&str>,
    ) -> Result<u32, ExtensionError> {
        if self.is_alive() {
            return Err(ProcessError::AlreadyRunning(self.label.clone()).into());
        }

        if let Some(marker) = stray_marker {
            self.kill_strays(spec, marker).await;
        }

        let handle = ProcessHandle::spawn(spec).await?;
        let pid = handle.pid();
        self.handle = Some(handle);
        Ok(pid)
    }

    async fn kill_strays(&self, spec: &ProcessSpec, marker: &str) {
        let Some(exe) = spec.program().file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        let strays =
            process_monitor::find_by_name_and_cmd_async(&exe, &[marker.to_string()]).await;
        let own = std::process::id();
        for stray in strays.into_iter().filter(|p| p.pid != own) {
            tracing::warn!(
                "[{}] Killing stray '{}' (pid: {}) left over from an earlier run",
                self.label,
                stray.name,
                stray.pid
            );
            if let Err(e) = force_kill_pid(stray.pid) {
                tracing::warn!("[{}] Could not kill stray pid {}: {}", self.label, stray.pid, e);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_alive()).unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().filter(|h| h.is_alive()).map(|h| h.pid())
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Terminate and release the child.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), ExtensionError> {
        match self.handle.take() {
            Some(handle) => handle.terminate(grace).await.map_err(Into::into),
            None => Ok(()),
        }
    }

    /// Release the handle but leave the child running.
    pub fn detach(&mut self) -> Option<u32> {
        self.handle.take().map(|h| {
            tracing::info!("[{}] Leaving pid {} running", self.label, h.pid());
            h.pid()
        })
    }

    pub async fn recent_output(&self, count: usize) -> Vec<LogLine> {
        match &self.handle {
            Some(h) => h.recent(count).await,
            None => Vec::new(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refuses_second_launch_while_alive() {
        let mut launcher = Launcher::new("sleeper");
        let spec = ProcessSpec::new("sleeper", "/bin/sh").args(["-c", "sleep 30"]);
        let pid = launcher.launch(&spec, None).await.unwrap();
        assert_eq!(launcher.pid(), Some(pid));

        let err = launcher.launch(&spec, None).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Process(ProcessError::AlreadyRunning(_))));

        launcher.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!launcher.is_alive());
        assert!(launcher.pid().is_none());
    }

    #[tokio::test]
    async fn test_relaunch_after_exit() {
        let mut launcher = Launcher::new("short");
        let spec = ProcessSpec::new("short", "/bin/sh").args(["-c", "exit 0"]);
        launcher.launch(&spec, None).await.unwrap();
        for _ in 0..100 {
            if !launcher.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!launcher.is_alive());
        assert!(launcher.launch(&spec, None).await.is_ok());
    }
}
