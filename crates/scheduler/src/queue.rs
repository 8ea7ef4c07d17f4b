use bitflags::bitflags;
use groupconfig::InvocationLocation;

/// A point in the command stream where owed actions are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallSite {
    Draw,
    BindPipeline,
    BindRenderTarget,
}

impl CallSite {
    pub const ALL: [CallSite; 3] = [CallSite::Draw, CallSite::BindPipeline, CallSite::BindRenderTarget];

    fn index(self) -> usize {
        match self {
            CallSite::Draw => 0,
            CallSite::BindPipeline => 1,
            CallSite::BindRenderTarget => 2,
        }
    }

    /// Site at which work for a group with this invocation location runs.
    pub fn for_invocation(location: InvocationLocation) -> Self {
        match location {
            InvocationLocation::BeforeDraw => CallSite::Draw,
            InvocationLocation::AfterDraw => CallSite::BindPipeline,
            InvocationLocation::OnRenderTargetChange => CallSite::BindRenderTarget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Effect,
    Binding,
    Constant,
    Preview,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Effect,
        ActionKind::Binding,
        ActionKind::Constant,
        ActionKind::Preview,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Pixel,
    Vertex,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Pixel, Stage::Vertex];
}

bitflags! {
    /// One bit per (action kind, stage) pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionBits: u8 {
        const EFFECT_PS   = 1 << 0;
        const EFFECT_VS   = 1 << 1;
        const BINDING_PS  = 1 << 2;
        const BINDING_VS  = 1 << 3;
        const CONSTANT_PS = 1 << 4;
        const CONSTANT_VS = 1 << 5;
        const PREVIEW_PS  = 1 << 6;
        const PREVIEW_VS  = 1 << 7;
    }
}

impl ActionBits {
    pub fn of(kind: ActionKind, stage: Stage) -> Self {
        match (kind, stage) {
            (ActionKind::Effect, Stage::Pixel) => Self::EFFECT_PS,
            (ActionKind::Effect, Stage::Vertex) => Self::EFFECT_VS,
            (ActionKind::Binding, Stage::Pixel) => Self::BINDING_PS,
            (ActionKind::Binding, Stage::Vertex) => Self::BINDING_VS,
            (ActionKind::Constant, Stage::Pixel) => Self::CONSTANT_PS,
            (ActionKind::Constant, Stage::Vertex) => Self::CONSTANT_VS,
            (ActionKind::Preview, Stage::Pixel) => Self::PREVIEW_PS,
            (ActionKind::Preview, Stage::Vertex) => Self::PREVIEW_VS,
        }
    }

    pub fn has(self, kind: ActionKind, stage: Stage) -> bool {
        self.contains(Self::of(kind, stage))
    }
}

/// Outstanding actions of one command list, per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionQueue {
    sites: [ActionBits; 3],
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, site: CallSite, bits: ActionBits) {
        self.sites[site.index()] |= bits;
    }

    pub fn remove(&mut self, site: CallSite, bits: ActionBits) {
        self.sites[site.index()].remove(bits);
    }

    /// Clears and returns everything pending at `site`.
    pub fn take(&mut self, site: CallSite) -> ActionBits {
        std::mem::take(&mut self.sites[site.index()])
    }

    pub fn pending(&self, site: CallSite) -> ActionBits {
        self.sites[site.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.sites.iter().all(|bits| bits.is_empty())
    }

    pub fn clear(&mut self) {
        self.sites = [ActionBits::empty(); 3];
    }

    /// Packed 24-bit view: draw in bits 0..8, pipeline bind in 8..16,
    /// render-target bind in 16..24.
    pub fn to_raw(&self) -> u32 {
        CallSite::ALL
            .iter()
            .map(|site| u32::from(self.pending(*site).bits()) << (8 * site.index()))
            .fold(0, |acc, bits| acc | bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_only_the_requested_site() {
        let mut queue = ActionQueue::new();
        queue.insert(CallSite::Draw, ActionBits::EFFECT_PS | ActionBits::CONSTANT_VS);
        queue.insert(CallSite::BindPipeline, ActionBits::EFFECT_PS);

        let taken = queue.take(CallSite::Draw);
        assert_eq!(taken, ActionBits::EFFECT_PS | ActionBits::CONSTANT_VS);
        assert!(queue.pending(CallSite::Draw).is_empty());
        assert_eq!(queue.pending(CallSite::BindPipeline), ActionBits::EFFECT_PS);

        queue.insert(CallSite::Draw, ActionBits::BINDING_PS);
        assert_eq!(queue.take(CallSite::Draw), ActionBits::BINDING_PS);
    }

    #[test]
    fn raw_layout_packs_sites_in_order() {
        let mut queue = ActionQueue::new();
        queue.insert(CallSite::Draw, ActionBits::of(ActionKind::Effect, Stage::Pixel));
        queue.insert(CallSite::BindPipeline, ActionBits::of(ActionKind::Binding, Stage::Vertex));
        queue.insert(CallSite::BindRenderTarget, ActionBits::of(ActionKind::Preview, Stage::Vertex));
        assert_eq!(queue.to_raw(), 0x01 | (0x08 << 8) | (0x80 << 16));

        queue.remove(CallSite::BindPipeline, ActionBits::BINDING_VS);
        assert_eq!(queue.to_raw(), 0x01 | (0x80 << 16));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn every_kind_and_stage_has_a_distinct_bit() {
        let mut seen = ActionBits::empty();
        for kind in ActionKind::ALL {
            for stage in Stage::ALL {
                let bit = ActionBits::of(kind, stage);
                assert!(!seen.intersects(bit));
                seen |= bit;
            }
        }
        assert_eq!(seen, ActionBits::all());
    }

    #[test]
    fn invocation_locations_map_to_sites() {
        assert_eq!(CallSite::for_invocation(InvocationLocation::BeforeDraw), CallSite::Draw);
        assert_eq!(
            CallSite::for_invocation(InvocationLocation::AfterDraw),
            CallSite::BindPipeline
        );
        assert_eq!(
            CallSite::for_invocation(InvocationLocation::OnRenderTargetChange),
            CallSite::BindRenderTarget
        );
    }
}
