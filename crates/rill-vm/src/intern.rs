use std::collections::HashSet;
use std::rc::Rc;

use crate::Node;

/// Hash-consing table for constructed nodes.
///
/// Structurally equal nodes interned through the same table are pointer-equal.
#[derive(Debug, Default)]
pub struct NodeInterner {
    nodes: HashSet<Rc<Node>>,
}

impl NodeInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, node: Node) -> Rc<Node> {
        if let Some(existing) = self.nodes.get(&node) {
            return Rc::clone(existing);
        }
        let node = Rc::new(node);
        self.nodes.insert(Rc::clone(&node));
        node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
