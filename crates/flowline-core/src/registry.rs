use crate::id::{ItemTypeId, NodeId};
use crate::time::SimTime;
use std::collections::{BTreeMap, HashMap};

/// An item type definition in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTypeDef {
    /// Stable key used by model files.
    pub key: String,
    pub name: String,
    /// Display color, e.g. `"#3366ff"`. Carried for front ends only.
    pub color: String,
    /// Per-node processing-time overrides for this type.
    pub overrides: BTreeMap<NodeId, SimTime>,
}

/// Builder for constructing an immutable [`ItemTypeRegistry`].
/// Three-phase lifecycle: registration -> overrides -> finalization.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    types: Vec<ItemTypeDef>,
    key_to_id: HashMap<String, ItemTypeId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: Register an item type. Returns its ID.
    pub fn register(
        &mut self,
        key: &str,
        name: &str,
        color: &str,
    ) -> Result<ItemTypeId, RegistryError> {
        if self.key_to_id.contains_key(key) {
            return Err(RegistryError::Duplicate(key.to_string()));
        }
        let id = ItemTypeId(self.types.len() as u32);
        self.types.push(ItemTypeDef {
            key: key.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            overrides: BTreeMap::new(),
        });
        self.key_to_id.insert(key.to_string(), id);
        Ok(id)
    }

    /// Phase 2: Set how long `node` takes to process items of type `id`.
    pub fn set_override(
        &mut self,
        id: ItemTypeId,
        node: NodeId,
        time: SimTime,
    ) -> Result<(), RegistryError> {
        let def = self
            .types
            .get_mut(id.0 as usize)
            .ok_or(RegistryError::UnknownType(id))?;
        def.overrides.insert(node, time);
        Ok(())
    }

    /// Lookup item type ID by key.
    pub fn id(&self, key: &str) -> Option<ItemTypeId> {
        self.key_to_id.get(key).copied()
    }

    /// The first registered type, used as a source's default.
    pub fn first(&self) -> Option<ItemTypeId> {
        (!self.types.is_empty()).then_some(ItemTypeId(0))
    }

    /// Phase 3: Finalize and build the immutable registry.
    pub fn build(self) -> Result<ItemTypeRegistry, RegistryError> {
        for def in &self.types {
            if let Some((&node, &time)) = def.overrides.iter().find(|(_, t)| **t < SimTime::ZERO) {
                return Err(RegistryError::NegativeOverride {
                    key: def.key.clone(),
                    node,
                    time,
                });
            }
        }
        Ok(ItemTypeRegistry {
            types: self.types,
            key_to_id: self.key_to_id,
        })
    }
}

/// Immutable item type catalog. Frozen after build(). Thread-safe to share.
#[derive(Debug, Clone, Default)]
pub struct ItemTypeRegistry {
    types: Vec<ItemTypeDef>,
    key_to_id: HashMap<String, ItemTypeId>,
}

impl ItemTypeRegistry {
    pub fn get(&self, id: ItemTypeId) -> Option<&ItemTypeDef> {
        self.types.get(id.0 as usize)
    }

    pub fn id(&self, key: &str) -> Option<ItemTypeId> {
        self.key_to_id.get(key).copied()
    }

    pub fn contains(&self, id: ItemTypeId) -> bool {
        (id.0 as usize) < self.types.len()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Display key for an item type, or `"?"` for an unknown id.
    pub fn key(&self, id: ItemTypeId) -> &str {
        self.get(id).map(|d| d.key.as_str()).unwrap_or("?")
    }

    /// The processing time `node` should use for `id`, if overridden.
    pub fn processing_override(&self, id: ItemTypeId, node: NodeId) -> Option<SimTime> {
        self.get(id).and_then(|def| def.overrides.get(&node).copied())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemTypeId, &ItemTypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, def)| (ItemTypeId(i as u32), def))
    }

    /// True if some item type passes through `node` in zero time.
    pub fn has_zero_override(&self, node: NodeId) -> bool {
        self.types
            .iter()
            .any(|def| def.overrides.get(&node).is_some_and(|t| *t == SimTime::ZERO))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate item type '{0}'")]
    Duplicate(String),
    #[error("unknown item type {0:?}")]
    UnknownType(ItemTypeId),
    #[error("item type '{key}' has negative processing time {time} at {node:?}")]
    NegativeOverride {
        key: String,
        node: NodeId,
        time: SimTime,
    },
}
