//! Arena-backed doubly linked instruction list
//!
//! Both the Prim IR and the machine instruction list are kept in a
//! [`List`]: nodes live in a vector and are addressed by [`NodeId`], so
//! insertion, replacement and removal are O(1) and handles stay valid after
//! edits. Removed nodes are unlinked and their slots left dead.

use crate::error::{Error, Result, SourceLoc};

/// Handle to a list node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone)]
struct Node<T> {
    value: T,
    loc: Option<SourceLoc>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    live: bool,
}

/// Doubly linked list over an arena
#[derive(Debug, Clone)]
pub struct List<T> {
    nodes: Vec<Node<T>>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        List {
            nodes: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> List<T> {
    /// Creates an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked nodes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no node is linked
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First node
    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    /// Last node
    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    /// Following node
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].next
    }

    /// Preceding node
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].prev
    }

    /// Node value
    pub fn get(&self, id: NodeId) -> &T {
        &self.nodes[id.0 as usize].value
    }

    /// Mutable node value
    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.nodes[id.0 as usize].value
    }

    /// Source location attached to a node
    pub fn loc(&self, id: NodeId) -> Option<&SourceLoc> {
        self.nodes[id.0 as usize].loc.as_ref()
    }

    /// Whether the handle still refers to a linked node
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.0 as usize).map(|n| n.live).unwrap_or(false)
    }

    fn alloc(&mut self, value: T, loc: Option<SourceLoc>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            value,
            loc,
            prev: None,
            next: None,
            live: true,
        });
        self.len += 1;
        id
    }

    /// Appends a node
    pub fn push_back(&mut self, value: T, loc: Option<SourceLoc>) -> NodeId {
        let id = self.alloc(value, loc);
        match self.tail {
            Some(t) => {
                self.nodes[t.0 as usize].next = Some(id);
                self.nodes[id.0 as usize].prev = Some(t);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Inserts a node before `at`, inheriting its location when `loc` is
    /// `None`
    pub fn insert_before(&mut self, at: NodeId, value: T, loc: Option<SourceLoc>) -> NodeId {
        let loc = loc.or_else(|| self.nodes[at.0 as usize].loc.clone());
        let id = self.alloc(value, loc);
        let prev = self.nodes[at.0 as usize].prev;
        self.nodes[id.0 as usize].prev = prev;
        self.nodes[id.0 as usize].next = Some(at);
        self.nodes[at.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        id
    }

    /// Inserts a node after `at`, inheriting its location
    pub fn insert_after(&mut self, at: NodeId, value: T) -> NodeId {
        let loc = self.nodes[at.0 as usize].loc.clone();
        let id = self.alloc(value, loc);
        let next = self.nodes[at.0 as usize].next;
        self.nodes[id.0 as usize].prev = Some(at);
        self.nodes[id.0 as usize].next = next;
        self.nodes[at.0 as usize].next = Some(id);
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = Some(id),
            None => self.tail = Some(id),
        }
        id
    }

    /// Replaces a node's value in place
    pub fn replace(&mut self, id: NodeId, value: T) -> T {
        std::mem::replace(&mut self.nodes[id.0 as usize].value, value)
    }

    /// Unlinks a node; returns the node that followed it
    pub fn remove(&mut self, id: NodeId) -> Option<NodeId> {
        let (prev, next) = {
            let n = &mut self.nodes[id.0 as usize];
            if !n.live {
                return n.next;
            }
            n.live = false;
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        next
    }

    /// Linked node handles in order
    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.nodes[id.0 as usize].next;
        }
        out
    }

    /// Linked values in order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        std::iter::successors(self.head, move |id| self.nodes[id.0 as usize].next)
            .map(move |id| (id, &self.nodes[id.0 as usize].value))
    }

    /// Checks the links: forward and backward walks agree, every linked
    /// node is live and the walk terminates
    pub fn verify(&self) -> Result<()> {
        let mut count = 0usize;
        let mut prev: Option<NodeId> = None;
        let mut cur = self.head;
        while let Some(id) = cur {
            let node = self
                .nodes
                .get(id.0 as usize)
                .ok_or_else(|| Error::internal(format!("dangling node handle {}", id.0)))?;
            if !node.live {
                return Err(Error::internal(format!("removed node {} still linked", id.0)));
            }
            if node.prev != prev {
                return Err(Error::internal(format!("broken back link at node {}", id.0)));
            }
            count += 1;
            if count > self.nodes.len() {
                return Err(Error::internal("instruction list contains a cycle"));
            }
            prev = Some(id);
            cur = node.next;
        }
        if prev != self.tail {
            return Err(Error::internal("instruction list tail is stale"));
        }
        if count != self.len {
            return Err(Error::internal(format!(
                "instruction list length {} but {} nodes linked",
                self.len, count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &List<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_insert_and_remove() {
        let mut list = List::new();
        let a = list.push_back(1, None);
        let c = list.push_back(3, None);
        list.insert_before(c, 2, None);
        list.insert_after(c, 4);
        list.insert_before(a, 0, None);
        assert_eq!(values(&list), vec![0, 1, 2, 3, 4]);
        list.verify().unwrap();

        assert_eq!(list.remove(c).map(|n| *list.get(n)), Some(4));
        assert_eq!(values(&list), vec![0, 1, 2, 4]);
        assert!(!list.contains(c));
        list.verify().unwrap();
    }

    #[test]
    fn test_remove_head_and_tail() {
        let mut list = List::new();
        let a = list.push_back(1, None);
        let b = list.push_back(2, None);
        list.remove(a);
        list.remove(b);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
        list.verify().unwrap();
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut list = List::new();
        list.push_back(1, None);
        let b = list.push_back(2, None);
        list.push_back(3, None);
        assert_eq!(list.replace(b, 9), 2);
        assert_eq!(values(&list), vec![1, 9, 3]);
    }
}
