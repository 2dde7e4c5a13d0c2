use std::collections::VecDeque;

use super::contact::Contact;
use super::node_id::NodeId;

/// Result of offering a contact to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketInsert {
    /// The contact was new and there was room for it.
    Added,
    /// The contact was already known and moved to the front.
    Refreshed,
    /// The bucket is full; `least_recent` is the eviction candidate.
    Full { least_recent: Contact },
}

/// A k-bucket: up to `capacity` contacts, most recently seen at the front.
#[derive(Clone, Debug)]
pub struct Bucket {
    contacts: VecDeque<Contact>,
    capacity: usize,
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            contacts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add or refresh a contact. A full bucket leaves the decision to the
    /// caller, who pings the least recently seen contact and then calls
    /// [`Bucket::resolve_full`].
    pub fn insert(&mut self, contact: Contact) -> BucketInsert {
        if let Some(pos) = self.position(&contact.node_id) {
            self.contacts.remove(pos);
            self.contacts.push_front(contact);
            return BucketInsert::Refreshed;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push_front(contact);
            return BucketInsert::Added;
        }

        match self.contacts.back() {
            Some(least_recent) => BucketInsert::Full {
                least_recent: least_recent.clone(),
            },
            // zero-capacity bucket
            None => BucketInsert::Full {
                least_recent: contact,
            },
        }
    }

    /// Apply the outcome of pinging `incumbent` after [`BucketInsert::Full`].
    ///
    /// A live incumbent is moved to the front and `contact` is rejected. A dead
    /// one is evicted and `contact` takes its place. The bucket may have
    /// changed while the ping was in flight, so both cases re-check it.
    pub fn resolve_full(&mut self, incumbent: &Contact, alive: bool, contact: Contact) -> bool {
        if alive {
            if let Some(pos) = self.position(&incumbent.node_id) {
                if let Some(existing) = self.contacts.remove(pos) {
                    self.contacts.push_front(existing);
                }
            }
            return false;
        }

        if let Some(pos) = self.position(&incumbent.node_id) {
            self.contacts.remove(pos);
        }
        !matches!(self.insert(contact), BucketInsert::Full { .. })
    }

    /// Every member, annotated with its distance to `target`.
    pub fn get_with_distance(&self, target: &NodeId) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|contact| {
                let mut contact = contact.clone();
                contact.calc_distance(target);
                contact
            })
            .collect()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.position(node_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    /// Members, most recently seen first.
    pub fn dump(&self) -> Vec<Contact> {
        self.contacts.iter().cloned().collect()
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.node_id == node_id)
    }
}
