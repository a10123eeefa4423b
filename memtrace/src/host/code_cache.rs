//! Code cache: translated fragments addressed by code address
//!
//! Each fragment occupies `[base, base + len * INSTR_STRIDE)`, so every node
//! has a stable code address that branches and saved return addresses can
//! name.

#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::ilist::Node;
use super::isa::{Label, Meta};
use crate::domain::HostError;

pub const INSTR_STRIDE: u64 = 16;

/// Where translated application blocks are placed
pub const FRAGMENT_AREA_BASE: u64 = 0x5000_0000_0000;
const FRAGMENT_SPAN: u64 = 0x10_0000;

#[derive(Debug)]
pub struct Fragment {
    base: u64,
    nodes: Vec<Node>,
    labels: HashMap<Label, usize>,
}

impl Fragment {
    #[must_use]
    pub fn new(base: u64, nodes: Vec<Node>) -> Self {
        let labels = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Node::Meta(Meta::Label(l)) => Some((*l, i)),
                _ => None,
            })
            .collect();
        Self { base, nodes, labels }
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn addr_of(&self, index: usize) -> u64 {
        self.base + index as u64 * INSTR_STRIDE
    }

    fn span(&self) -> u64 {
        (self.nodes.len() as u64).max(1) * INSTR_STRIDE
    }

    /// # Errors
    /// `UnknownLabel` if the label is not placed in this fragment.
    pub fn label_index(&self, label: Label) -> Result<usize, HostError> {
        self.labels.get(&label).copied().ok_or(HostError::UnknownLabel(label.0))
    }
}

/// One thread's translated code plus the shared images mapped into it
#[derive(Debug, Default)]
pub struct CodeCache {
    fragments: BTreeMap<u64, Arc<Fragment>>,
    by_tag: HashMap<u64, u64>,
    next_base: u64,
}

impl CodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self { next_base: FRAGMENT_AREA_BASE, ..Self::default() }
    }

    /// Registers a fragment that already has its own address (shared code).
    pub fn insert_shared(&mut self, fragment: Arc<Fragment>) {
        self.fragments.insert(fragment.base(), fragment);
    }

    /// Places a translated block and returns its entry address.
    pub fn insert_block(&mut self, tag: u64, nodes: Vec<Node>) -> u64 {
        let base = self.next_base;
        let fragment = Fragment::new(base, nodes);
        self.next_base += fragment.span().div_ceil(FRAGMENT_SPAN).max(1) * FRAGMENT_SPAN;
        self.fragments.insert(base, Arc::new(fragment));
        self.by_tag.insert(tag, base);
        base
    }

    /// Entry address of the translation of application block `tag`
    #[must_use]
    pub fn entry_for(&self, tag: u64) -> Option<u64> {
        self.by_tag.get(&tag).copied()
    }

    /// Fragment containing `addr` and the node index there
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<(Arc<Fragment>, usize)> {
        let (base, fragment) = self.fragments.range(..=addr).next_back()?;
        let offset = addr - base;
        if !offset.is_multiple_of(INSTR_STRIDE) || offset >= fragment.span() {
            return None;
        }
        Some((Arc::clone(fragment), (offset / INSTR_STRIDE) as usize))
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.by_tag.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::isa::Instr;

    #[test]
    fn test_lookup_resolves_node_addresses() {
        let mut cache = CodeCache::new();
        let entry = cache.insert_block(
            0x400,
            vec![Node::App(Instr::nop(0x400)), Node::Meta(Meta::Label(Label(3)))],
        );
        let (frag, idx) = cache.lookup(entry + INSTR_STRIDE).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(frag.label_index(Label(3)), Ok(1));
        assert!(cache.lookup(entry + 1).is_none());
        assert_eq!(cache.entry_for(0x400), Some(entry));
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        let mut cache = CodeCache::new();
        let a = cache.insert_block(1, vec![Node::App(Instr::nop(1))]);
        let b = cache.insert_block(2, vec![Node::App(Instr::nop(2))]);
        assert!(b >= a + FRAGMENT_SPAN);
        assert_eq!(cache.block_count(), 2);
    }
}
