//! Per-family Patricia trie over remote-address prefixes.
//!
//! The index only narrows the candidate set for a lookup; the table applies
//! the full match rules to whatever comes back. Routes whose remote address
//! (or family) is wildcarded live in a flat bucket that every lookup scans.

use std::collections::HashMap;

use log::trace;

use crate::helpers::{canonical, common_prefix_len, get_bit, prefix_covers};
use crate::types::RouteId;

#[derive(Debug, Default)]
struct Node {
    key: u128,
    prefix_len: u8,
    children: [Option<u32>; 2],
    routes: Vec<RouteId>,
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Root(u16),
    Child(u32, u8),
}

#[derive(Debug, Default)]
pub(crate) struct PrefixIndex {
    nodes: Vec<Node>,
    free: Vec<u32>,
    roots: HashMap<u16, u32>,
    wildcard: Vec<RouteId>,
}

impl PrefixIndex {
    fn link(&self, link: Link) -> Option<u32> {
        match link {
            Link::Root(family) => self.roots.get(&family).copied(),
            Link::Child(parent, bit) => self.nodes[parent as usize].children[usize::from(bit)],
        }
    }

    fn set_link(&mut self, link: Link, to: Option<u32>) {
        match (link, to) {
            (Link::Root(family), Some(n)) => {
                self.roots.insert(family, n);
            }
            (Link::Root(family), None) => {
                self.roots.remove(&family);
            }
            (Link::Child(parent, bit), to) => self.nodes[parent as usize].children[usize::from(bit)] = to,
        }
    }

    fn alloc(&mut self, key: u128, prefix_len: u8, routes: Vec<RouteId>) -> u32 {
        let node = Node {
            key,
            prefix_len,
            children: [None, None],
            routes,
        };
        if let Some(slot) = self.free.pop() {
            self.nodes[slot as usize] = node;
            return slot;
        }
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn retire(&mut self, slot: u32) {
        self.nodes[slot as usize] = Node::default();
        self.free.push(slot);
    }

    pub(crate) fn insert_wildcard(&mut self, id: RouteId) {
        self.wildcard.push(id);
    }

    pub(crate) fn remove_wildcard(&mut self, id: RouteId) -> bool {
        match self.wildcard.iter().position(|r| *r == id) {
            Some(at) => {
                self.wildcard.remove(at);
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert(&mut self, family: u16, key: u128, prefix_len: u8, id: RouteId) {
        let key = canonical(key, prefix_len);
        let mut link = Link::Root(family);
        loop {
            let Some(cur) = self.link(link) else {
                trace!("[INSERT] index: empty link for /{prefix_len}");
                let leaf = self.alloc(key, prefix_len, vec![id]);
                self.set_link(link, Some(leaf));
                return;
            };
            let (node_key, node_len) = {
                let n = &self.nodes[cur as usize];
                (n.key, n.prefix_len)
            };
            let cpl = common_prefix_len(node_key, key, prefix_len.min(node_len));

            if cpl == node_len && node_len == prefix_len {
                self.nodes[cur as usize].routes.push(id);
                return;
            }

            // New prefix sits above the current node.
            if cpl == prefix_len && prefix_len < node_len {
                let above = self.alloc(key, prefix_len, vec![id]);
                let bit = get_bit(node_key, prefix_len);
                self.nodes[above as usize].children[usize::from(bit)] = Some(cur);
                self.set_link(link, Some(above));
                return;
            }

            if cpl < node_len && cpl < prefix_len {
                trace!("[INSERT] index: split at bit {cpl}");
                let internal = self.alloc(canonical(key, cpl), cpl, Vec::new());
                let leaf = self.alloc(key, prefix_len, vec![id]);
                let new_bit = get_bit(key, cpl);
                let node = &mut self.nodes[internal as usize];
                node.children[usize::from(new_bit)] = Some(leaf);
                node.children[usize::from(1 - new_bit)] = Some(cur);
                self.set_link(link, Some(internal));
                return;
            }

            // cpl == node_len < prefix_len: descend.
            link = Link::Child(cur, get_bit(key, node_len));
        }
    }

    /// Remove one route id; false when it was not indexed under that prefix.
    pub(crate) fn remove(&mut self, family: u16, key: u128, prefix_len: u8, id: RouteId) -> bool {
        let key = canonical(key, prefix_len);
        let mut path: Vec<Link> = Vec::new();
        let mut link = Link::Root(family);
        let target = loop {
            let Some(cur) = self.link(link) else {
                return false;
            };
            let n = &self.nodes[cur as usize];
            if n.prefix_len > prefix_len || !prefix_covers(n.key, n.prefix_len, key) {
                return false;
            }
            if n.prefix_len == prefix_len {
                break cur;
            }
            path.push(link);
            link = Link::Child(cur, get_bit(key, n.prefix_len));
        };

        let routes = &mut self.nodes[target as usize].routes;
        let Some(at) = routes.iter().position(|r| *r == id) else {
            return false;
        };
        routes.remove(at);
        if routes.is_empty() {
            self.prune(link, target);
            if let (Link::Child(parent, _), Some(parent_link)) = (link, path.pop()) {
                self.collapse(parent_link, parent);
            }
        }
        true
    }

    // Drop a routeless node that no longer separates two subtrees.
    fn prune(&mut self, link: Link, slot: u32) -> bool {
        let node = &self.nodes[slot as usize];
        if !node.routes.is_empty() {
            return false;
        }
        match node.children {
            [Some(_), Some(_)] => false,
            [Some(only), None] | [None, Some(only)] => {
                self.set_link(link, Some(only));
                self.retire(slot);
                true
            }
            [None, None] => {
                self.set_link(link, None);
                self.retire(slot);
                true
            }
        }
    }

    fn collapse(&mut self, link: Link, slot: u32) {
        if self.link(link) == Some(slot) {
            self.prune(link, slot);
        }
    }

    /// Route ids whose indexed prefix covers `key/prefix_len`, shortest
    /// prefix first, followed by the wildcard bucket.
    pub(crate) fn candidates(&self, family: u16, key: u128, prefix_len: u8) -> Vec<RouteId> {
        let mut out = Vec::new();
        let mut cur = self.roots.get(&family).copied();
        while let Some(slot) = cur {
            let n = &self.nodes[slot as usize];
            if n.prefix_len > prefix_len || !prefix_covers(n.key, n.prefix_len, key) {
                break;
            }
            out.extend_from_slice(&n.routes);
            if n.prefix_len >= prefix_len {
                break;
            }
            cur = n.children[usize::from(get_bit(key, n.prefix_len))];
        }
        out.extend_from_slice(&self.wildcard);
        out
    }

    /// Live trie nodes, wildcard bucket excluded.
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.roots.clear();
        self.wildcard.clear();
    }
}
