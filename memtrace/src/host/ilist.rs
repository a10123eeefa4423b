//! Instruction list for one basic block
//!
//! Nodes keep a stable [`InstrHandle`] across insertions, so the planner can
//! keep inserting "before the application instruction" while the list grows.

use super::isa::{Instr, Label, Meta};
use crate::domain::HostError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    App(Instr),
    Meta(Meta),
}

impl Node {
    #[must_use]
    pub fn is_meta(&self) -> bool {
        matches!(self, Node::Meta(_))
    }
}

/// Stable handle of a node inside an [`InstrList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrHandle(usize);

impl InstrHandle {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstrList {
    nodes: Vec<(InstrHandle, Node)>,
    next_handle: usize,
    next_label: u32,
}

impl InstrList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_app(instrs: Vec<Instr>) -> Self {
        let mut list = Self::new();
        for instr in instrs {
            list.append(Node::App(instr));
        }
        list
    }

    fn fresh_handle(&mut self) -> InstrHandle {
        let handle = InstrHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub fn append(&mut self, node: Node) -> InstrHandle {
        let handle = self.fresh_handle();
        self.nodes.push((handle, node));
        handle
    }

    /// Position of `handle` in list order
    #[must_use]
    pub fn position(&self, handle: InstrHandle) -> Option<usize> {
        self.nodes.iter().position(|(h, _)| *h == handle)
    }

    /// Inserts `meta` immediately before `at`.
    ///
    /// # Errors
    /// Returns `NoSuchInstr` if `at` is not in this list.
    pub fn preinsert(&mut self, at: InstrHandle, meta: Meta) -> Result<InstrHandle, HostError> {
        let pos = self.position(at).ok_or(HostError::NoSuchInstr(at.0))?;
        let handle = self.fresh_handle();
        self.nodes.insert(pos, (handle, Node::Meta(meta)));
        Ok(handle)
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    #[must_use]
    pub fn get(&self, handle: InstrHandle) -> Option<&Node> {
        self.nodes.iter().find(|(h, _)| *h == handle).map(|(_, n)| n)
    }

    /// Handles of all application instructions, in list order
    #[must_use]
    pub fn app_handles(&self) -> Vec<InstrHandle> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.is_meta())
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|(_, n)| n)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes.into_iter().map(|(_, n)| n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::isa::Reg;

    #[test]
    fn test_preinsert_keeps_handles_stable() {
        let mut list = InstrList::from_app(vec![Instr::nop(0x10), Instr::nop(0x11)]);
        let handles = list.app_handles();
        list.preinsert(handles[1], Meta::TestZero { reg: Reg::Rax }).unwrap();
        list.preinsert(handles[1], Meta::TestZero { reg: Reg::Rbx }).unwrap();

        assert_eq!(list.len(), 4);
        assert_eq!(list.position(handles[1]), Some(3));
        let metas: Vec<_> = list.iter().filter(|n| n.is_meta()).cloned().collect();
        assert_eq!(metas[0], Node::Meta(Meta::TestZero { reg: Reg::Rax }));
    }

    #[test]
    fn test_preinsert_unknown_handle() {
        let mut list = InstrList::new();
        let err = list.preinsert(InstrHandle(9), Meta::Label(Label(0))).unwrap_err();
        assert_eq!(err, HostError::NoSuchInstr(9));
    }

    #[test]
    fn test_labels_are_unique() {
        let mut list = InstrList::new();
        assert_ne!(list.new_label(), list.new_label());
    }
}
