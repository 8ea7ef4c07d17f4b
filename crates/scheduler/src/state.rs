use std::collections::{BTreeMap, HashMap};

use groupconfig::{GroupId, ShaderIdentity};
use pipestate::StateTracker;

use crate::queue::{ActionKind, ActionQueue, CallSite, Stage};
use crate::resolve::ResolvedView;

/// Lifecycle of one owed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Unresolved { attempts: u32 },
    /// Target found; waiting for the call site to fire.
    Resolved(ResolvedView),
    Executed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub group: GroupId,
    /// Site at which the action executes once resolved.
    pub site: CallSite,
    pub state: WorkState,
}

impl WorkItem {
    pub fn new(group: GroupId, site: CallSite) -> Self {
        Self {
            group,
            site,
            state: WorkState::Unresolved { attempts: 0 },
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            WorkState::Unresolved { .. } | WorkState::Resolved(_)
        )
    }

    pub fn resolved_view(&self) -> Option<ResolvedView> {
        match self.state {
            WorkState::Resolved(view) => Some(view),
            _ => None,
        }
    }

    pub fn resolve(&mut self, view: ResolvedView) {
        self.state = WorkState::Resolved(view);
    }

    /// Retires a resolved item and hands back its target. Unresolved items
    /// have nothing to execute against and are left as they are.
    pub fn execute(&mut self) -> Option<ResolvedView> {
        let view = self.resolved_view()?;
        self.state = WorkState::Executed;
        Some(view)
    }

    /// Records a failed resolution. The item stays queued only when the group
    /// requeues after failure and the retry limit (if any) is not exhausted.
    pub fn fail(&mut self, requeue: bool, limit: Option<u32>) -> bool {
        let attempts = match self.state {
            WorkState::Unresolved { attempts } => attempts + 1,
            _ => 1,
        };
        let keep = requeue && limit.map_or(true, |limit| attempts < limit);
        self.state = if keep {
            WorkState::Unresolved { attempts }
        } else {
            WorkState::Abandoned
        };
        keep
    }
}

/// The shader bound to one stage and the work its groups still owe.
#[derive(Debug, Clone, Default)]
pub struct ShaderData {
    pub identity: ShaderIdentity,
    pub groups: Vec<GroupId>,
    pub techniques: BTreeMap<String, WorkItem>,
    pub bindings: BTreeMap<String, WorkItem>,
    pub constants: BTreeMap<GroupId, WorkItem>,
    pub preview: Option<WorkItem>,
}

impl ShaderData {
    pub fn has_work(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Effect => !self.techniques.is_empty(),
            ActionKind::Binding => !self.bindings.is_empty(),
            ActionKind::Constant => !self.constants.is_empty(),
            ActionKind::Preview => self.preview.is_some(),
        }
    }

    /// Drops unresolved work of groups the newly bound shader no longer
    /// matches. Resolved work keeps its target and still runs.
    pub(crate) fn rebind(&mut self, identity: ShaderIdentity, groups: Vec<GroupId>) {
        let keep = |item: &WorkItem| item.resolved_view().is_some() || groups.contains(&item.group);
        self.techniques.retain(|_, item| keep(item));
        self.bindings.retain(|_, item| keep(item));
        self.constants.retain(|_, item| keep(item));
        if !self.preview.as_ref().is_some_and(keep) {
            self.preview = None;
        }
        self.identity = identity;
        self.groups = groups;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Everything the core tracks for one command list.
#[derive(Debug, Default)]
pub struct CommandListState {
    pub pixel: ShaderData,
    pub vertex: ShaderData,
    pub queue: ActionQueue,
    pub tracker: StateTracker,
    /// Render targets already looked up for the current target binding.
    pub(crate) resolved_targets: HashMap<u32, ResolvedView>,
}

impl CommandListState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shader(&self, stage: Stage) -> &ShaderData {
        match stage {
            Stage::Pixel => &self.pixel,
            Stage::Vertex => &self.vertex,
        }
    }

    pub fn shader_mut(&mut self, stage: Stage) -> &mut ShaderData {
        match stage {
            Stage::Pixel => &mut self.pixel,
            Stage::Vertex => &mut self.vertex,
        }
    }

    /// Called whenever the host starts recording into the list.
    pub fn reset(&mut self) {
        self.pixel.clear();
        self.vertex.clear();
        self.queue.clear();
        self.tracker.reset();
        self.resolved_targets.clear();
    }
}
