//! Connections holding decrypted plaintext the poller cannot see
//!
//! A TLS engine may decrypt a whole record while the caller only asked for
//! part of it. The rest sits inside the engine, the socket is no longer
//! readable, and a level-triggered poller would never report the connection
//! again. Each worker keeps one list of such connections and services it
//! once per iteration.
//!
//! The list is doubly linked through connection ids rather than pointers,
//! so insert, remove and membership are O(1) and iteration is in insertion
//! order, newest first.

use crate::conn::ConnId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: Option<ConnId>,
    next: Option<ConnId>,
}

/// Per-worker buffered-plaintext list
#[derive(Debug, Default)]
pub struct BufferedList {
    head: Option<ConnId>,
    links: HashMap<ConnId, Links>,
}

impl BufferedList {
    pub fn new() -> Self {
        BufferedList::default()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Link `id` at the head; returns false if it was already linked
    pub fn insert(&mut self, id: ConnId) -> bool {
        if self.contains(id) {
            return false;
        }
        if let Some(old) = self.head {
            if let Some(links) = self.links.get_mut(&old) {
                links.prev = Some(id);
            }
        }
        self.links.insert(
            id,
            Links {
                prev: None,
                next: self.head,
            },
        );
        self.head = Some(id);
        true
    }

    /// Unlink `id`; returns false if it was not linked
    pub fn remove(&mut self, id: ConnId) -> bool {
        let Some(Links { prev, next }) = self.links.remove(&id) else {
            return false;
        };

        match prev {
            Some(prev) => {
                if let Some(links) = self.links.get_mut(&prev) {
                    links.next = next;
                }
            }
            None => self.head = next,
        }

        if let Some(next) = next {
            if let Some(links) = self.links.get_mut(&next) {
                links.prev = prev;
            }
        }
        true
    }

    /// Members from head to tail
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Copy of the members, for servicing while the list changes
    pub fn snapshot(&self) -> Vec<ConnId> {
        self.iter().collect()
    }
}

pub struct Iter<'a> {
    list: &'a BufferedList,
    cursor: Option<ConnId>,
}

impl Iterator for Iter<'_> {
    type Item = ConnId;

    fn next(&mut self) -> Option<ConnId> {
        let id = self.cursor?;
        self.cursor = self.list.links.get(&id).and_then(|links| links.next);
        Some(id)
    }
}
