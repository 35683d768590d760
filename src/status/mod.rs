//! Ordered label/value status for the display pipeline. Read-only.

use serde::Serialize;

use crate::extension::{Scope, StatusField};
use crate::supervisor::{ExtensionState, LifecyclePhase, Supervisor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionStatus {
    pub name: String,
    pub scope: Scope,
    pub phase: LifecyclePhase,
    pub fields: Vec<StatusField>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusAggregator {
    pub show_disabled: bool,
}

impl StatusAggregator {
    pub fn new(show_disabled: bool) -> Self {
        Self { show_disabled }
    }

    /// Node extensions first, then the instance's own, each in declared order.
    pub fn collect(&self, supervisor: &Supervisor) -> Vec<ExtensionStatus> {
        let mut rows = supervisor.node().rendered();
        rows.extend(supervisor.rendered());

        rows.into_iter()
            .filter(|(state, _)| self.visible(state))
            .map(|(state, mut fields)| {
                if let Some(version) = &state.version {
                    fields.push(StatusField::new("Version", version.clone()));
                }
                ExtensionStatus {
                    name: state.spec.name,
                    scope: state.spec.scope,
                    phase: state.phase,
                    fields,
                }
            })
            .collect()
    }

    fn visible(&self, state: &ExtensionState) -> bool {
        self.show_disabled || (state.spec.enabled && state.phase != LifecyclePhase::Disabled)
    }
}
