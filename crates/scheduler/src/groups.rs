use std::collections::{BTreeMap, HashMap};

use groupconfig::{GroupId, HookConfig, ShaderIdentity, ToggleGroup};
use tracing::debug;

use crate::queue::Stage;

/// The live toggle-group collection, indexed by shader identity per stage.
#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<GroupId, ToggleGroup>,
    pixel: HashMap<ShaderIdentity, Vec<GroupId>>,
    vertex: HashMap<ShaderIdentity, Vec<GroupId>>,
    editing: Option<GroupId>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HookConfig) -> Self {
        let mut registry = Self::new();
        for group in &config.groups {
            registry.groups.insert(group.id, group.clone());
        }
        registry.reindex();
        registry
    }

    fn reindex(&mut self) {
        self.pixel.clear();
        self.vertex.clear();
        for group in self.groups.values() {
            for identity in group.pixel_shaders.iter().filter(|id| !id.is_none()) {
                self.pixel.entry(*identity).or_default().push(group.id);
            }
            for identity in group.vertex_shaders.iter().filter(|id| !id.is_none()) {
                self.vertex.entry(*identity).or_default().push(group.id);
            }
        }
    }

    pub fn get(&self, id: GroupId) -> Option<&ToggleGroup> {
        self.groups.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToggleGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Active groups listing `identity` for `stage`, in id order. The null
    /// identity matches nothing.
    pub fn matching(&self, stage: Stage, identity: ShaderIdentity) -> Vec<GroupId> {
        if identity.is_none() {
            return Vec::new();
        }
        let index = match stage {
            Stage::Pixel => &self.pixel,
            Stage::Vertex => &self.vertex,
        };
        index
            .get(&identity)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.groups.get(id).is_some_and(|group| group.active))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn upsert(&mut self, group: ToggleGroup) {
        debug!(group = %group.label(), "toggle group updated");
        self.groups.insert(group.id, group);
        self.reindex();
    }

    pub fn remove(&mut self, id: GroupId) -> Option<ToggleGroup> {
        let removed = self.groups.remove(&id);
        if removed.is_some() {
            if self.editing == Some(id) {
                self.editing = None;
            }
            self.reindex();
        }
        removed
    }

    pub fn set_active(&mut self, id: GroupId, active: bool) -> bool {
        match self.groups.get_mut(&id) {
            Some(group) => {
                group.active = active;
                true
            }
            None => false,
        }
    }

    pub fn editing(&self) -> Option<GroupId> {
        self.editing
    }

    pub fn set_editing(&mut self, id: Option<GroupId>) {
        self.editing = id.filter(|id| self.groups.contains_key(id));
    }

    pub(crate) fn get_mut(&mut self, id: GroupId) -> Option<&mut ToggleGroup> {
        self.groups.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[[groups]]
id = 1
name = "HUD"
pixel_shaders = ["0x1A2B3C4D"]

[[groups]]
id = 2
name = "Shadows"
active = false
pixel_shaders = ["0x1A2B3C4D"]
vertex_shaders = [77]
"#;

    #[test]
    fn matching_skips_inactive_groups() {
        let config = HookConfig::from_toml_str(SAMPLE).unwrap();
        let mut registry = GroupRegistry::from_config(&config);
        let hash = ShaderIdentity(0x1A2B_3C4D);

        assert_eq!(registry.matching(Stage::Pixel, hash), vec![GroupId(1)]);
        assert!(registry.matching(Stage::Vertex, ShaderIdentity(77)).is_empty());

        registry.set_active(GroupId(2), true);
        assert_eq!(registry.matching(Stage::Pixel, hash), vec![GroupId(1), GroupId(2)]);
        assert_eq!(registry.matching(Stage::Vertex, ShaderIdentity(77)), vec![GroupId(2)]);
        assert!(registry.matching(Stage::Pixel, ShaderIdentity::NONE).is_empty());
    }

    #[test]
    fn upsert_and_remove_reindex() {
        let mut registry = GroupRegistry::new();
        let mut group = ToggleGroup::new(5, "Bloom");
        group.pixel_shaders.insert(ShaderIdentity(9));
        registry.upsert(group.clone());
        registry.set_editing(Some(GroupId(5)));
        assert_eq!(registry.matching(Stage::Pixel, ShaderIdentity(9)), vec![GroupId(5)]);

        group.pixel_shaders.clear();
        group.pixel_shaders.insert(ShaderIdentity(10));
        registry.upsert(group);
        assert!(registry.matching(Stage::Pixel, ShaderIdentity(9)).is_empty());
        assert_eq!(registry.matching(Stage::Pixel, ShaderIdentity(10)), vec![GroupId(5)]);

        assert!(registry.remove(GroupId(5)).is_some());
        assert_eq!(registry.editing(), None);
        assert!(registry.remove(GroupId(5)).is_none());
    }

    #[test]
    fn editing_requires_a_known_group() {
        let mut registry = GroupRegistry::new();
        registry.set_editing(Some(GroupId(3)));
        assert_eq!(registry.editing(), None);
    }
}
