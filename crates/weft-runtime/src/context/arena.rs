use std::fmt;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use weft_core::error::Result;
use weft_core::tag::TagBag;

use super::ContextDetails;
use crate::journal::JournalHandle;

/// Generational index of a context in its scope's arena. A handle to a
/// closed context never aliases a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    index: u32,
    generation: u64,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}.{}", self.index, self.generation)
    }
}

pub(crate) type CloseCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub(crate) struct ContextNode {
    pub parent: Option<ContextId>,
    pub children: Vec<ContextId>,
    pub data: TagBag,
    pub token: CancellationToken,
    pub cancel_reason: Option<String>,
    pub close_callbacks: Vec<CloseCallback>,
    pub details: ContextDetails,
    pub journal: JournalHandle,
    /// Keys of the keyed execs enclosing this context.
    pub path: Vec<String>,
    pub timer: Option<JoinHandle<()>>,
}

struct Slot {
    generation: u64,
    node: Option<ContextNode>,
}

#[derive(Default)]
pub(crate) struct ContextArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ContextArena {
    pub fn insert(&mut self, node: ContextNode) -> ContextId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return ContextId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        ContextId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: ContextId) -> Option<&ContextNode> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut ContextNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Take a node out, unlinking it from its parent and retiring the handle.
    pub fn remove(&mut self, id: ContextId) -> Option<ContextNode> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(id.index);

        if let Some(parent) = node.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|c| *c != id);
        }
        Some(node)
    }

    /// `id` and its live descendants, deepest first.
    pub fn subtree(&self, id: ContextId) -> Vec<ContextId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                order.push(current);
                stack.extend(node.children.iter().copied());
            }
        }
        order.sort_by_key(|c| std::cmp::Reverse(self.depth(*c)));
        order
    }

    /// Every live context, deepest first.
    pub fn all(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(index, s)| ContextId {
                index: index as u32,
                generation: s.generation,
            })
            .collect();
        ids.sort_by_key(|c| std::cmp::Reverse(self.depth(*c)));
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    fn depth(&self, id: ContextId) -> usize {
        self.get(id).map(|n| n.details.depth).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(parent: Option<ContextId>, depth: usize) -> ContextNode {
        ContextNode {
            parent,
            children: Vec::new(),
            data: TagBag::new(),
            token: CancellationToken::new(),
            cancel_reason: None,
            close_callbacks: Vec::new(),
            details: ContextDetails {
                name: None,
                key: None,
                depth,
                started_at: Utc::now(),
                ended_at: None,
            },
            journal: JournalHandle::default(),
            path: Vec::new(),
            timer: None,
        }
    }

    #[test]
    fn test_stale_handles_do_not_alias() {
        let mut arena = ContextArena::default();
        let first = arena.insert(node(None, 0));
        assert!(arena.remove(first).is_some());

        let second = arena.insert(node(None, 0));
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
        assert!(arena.remove(first).is_none());
    }

    #[test]
    fn test_generation_outlives_u32_reuse() {
        let mut arena = ContextArena::default();
        let first = arena.insert(node(None, 0));
        arena.slots[0].generation = u64::from(u32::MAX);
        let worn = ContextId {
            index: 0,
            generation: u64::from(u32::MAX),
        };
        assert!(arena.remove(worn).is_some());

        let next = arena.insert(node(None, 0));
        assert_eq!(next.generation, u64::from(u32::MAX) + 1);
        assert!(arena.get(first).is_none());
        assert!(arena.get(next).is_some());
        assert_eq!(next.to_string(), format!("ctx-0.{}", u64::from(u32::MAX) + 1));
    }

    #[test]
    fn test_subtree_is_deepest_first_and_remove_unlinks() {
        let mut arena = ContextArena::default();
        let root = arena.insert(node(None, 0));
        let child = arena.insert(node(Some(root), 1));
        arena.get_mut(root).unwrap().children.push(child);
        let grandchild = arena.insert(node(Some(child), 2));
        arena.get_mut(child).unwrap().children.push(grandchild);

        assert_eq!(arena.subtree(root), vec![grandchild, child, root]);

        arena.remove(grandchild);
        assert!(arena.get(child).unwrap().children.is_empty());
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.all(), vec![child, root]);
    }
}
