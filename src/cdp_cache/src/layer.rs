use crate::CdpError;
use std::collections::BTreeMap;
use std::fmt;

/// Handle of a cache layer. Layers live in a [`LayerTree`] and refer to their
/// parent by id, so a parent can never be dropped while a child still names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(pub u32);

impl LayerId {
    /// The layer sitting directly over the durable store.
    pub const ROOT: LayerId = LayerId(0);

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node<L> {
    parent: Option<LayerId>,
    layer: L,
}

/// Arena of copy-on-write layers chained child to parent.
pub struct LayerTree<L> {
    nodes: BTreeMap<LayerId, Node<L>>,
}

impl<L> LayerTree<L> {
    pub fn new(root: L) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            LayerId::ROOT,
            Node {
                parent: None,
                layer: root,
            },
        );
        Self { nodes }
    }

    pub fn insert(&mut self, id: LayerId, parent: LayerId, layer: L) -> Result<(), CdpError> {
        if self.nodes.contains_key(&id) {
            return Err(CdpError::LayerExists(id.0));
        }
        self.check(parent)?;
        self.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                layer,
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn check(&self, id: LayerId) -> Result<(), CdpError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(CdpError::UnknownLayer(id.0))
        }
    }

    pub fn get(&self, id: LayerId) -> Result<&L, CdpError> {
        self.nodes
            .get(&id)
            .map(|node| &node.layer)
            .ok_or(CdpError::UnknownLayer(id.0))
    }

    pub fn get_mut(&mut self, id: LayerId) -> Result<&mut L, CdpError> {
        self.nodes
            .get_mut(&id)
            .map(|node| &mut node.layer)
            .ok_or(CdpError::UnknownLayer(id.0))
    }

    pub fn parent(&self, id: LayerId) -> Result<Option<LayerId>, CdpError> {
        self.nodes
            .get(&id)
            .map(|node| node.parent)
            .ok_or(CdpError::UnknownLayer(id.0))
    }

    /// Ids from `id` up to the root, nearest first.
    pub fn lineage(&self, id: LayerId) -> Result<Vec<LayerId>, CdpError> {
        let mut ids = vec![id];
        let mut cursor = self.parent(id)?;
        while let Some(parent) = cursor {
            ids.push(parent);
            cursor = self.parent(parent)?;
        }
        Ok(ids)
    }

    /// Layers from `id` up to the root, nearest first.
    pub fn chain(&self, id: LayerId) -> Result<Vec<&L>, CdpError> {
        self.lineage(id)?
            .into_iter()
            .map(|layer_id| self.get(layer_id))
            .collect()
    }

    pub fn has_children(&self, id: LayerId) -> bool {
        self.nodes.values().any(|node| node.parent == Some(id))
    }

    /// Rebinds `id` under `parent`. The root stays parentless and a layer can
    /// never become its own ancestor.
    pub fn set_parent(&mut self, id: LayerId, parent: LayerId) -> Result<(), CdpError> {
        self.check(id)?;
        if id.is_root() {
            return Err(CdpError::RootLayer);
        }
        if self.lineage(parent)?.contains(&id) {
            return Err(CdpError::LayerCycle {
                layer: id.0,
                parent: parent.0,
            });
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Drops a layer. Children must be removed first.
    pub fn remove(&mut self, id: LayerId) -> Result<L, CdpError> {
        if id.is_root() {
            return Err(CdpError::RootLayer);
        }
        self.check(id)?;
        if self.has_children(id) {
            return Err(CdpError::LayerHasChildren(id.0));
        }
        self.nodes
            .remove(&id)
            .map(|node| node.layer)
            .ok_or(CdpError::UnknownLayer(id.0))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
