use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::bucket::{Bucket, BucketInsert};
use super::contact::{sort_by_distance, Contact};
use super::node_id::{NodeId, ID_LENGTH};

/// Number of buckets: one per bit of the identifier.
pub const BUCKET_COUNT: usize = ID_LENGTH * 8;

/// Liveness probe used when a full bucket has to choose between its least
/// recently seen contact and a newcomer.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, contact: &Contact) -> bool;
}

/// Routing table for the DHT: `BUCKET_COUNT` k-buckets behind one lock.
///
/// Bucket `i` holds the contacts whose distance to `me` has its highest set
/// bit at position `i`, counted from the most significant bit.
pub struct RoutingTable {
    me: Contact,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    /// Create a new routing table with buckets of capacity `k`
    pub fn new(me: Contact, k: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| Bucket::new(k)).collect();

        Self {
            me,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    /// Add or refresh a contact.
    ///
    /// When the target bucket is full and a `pinger` is supplied, the least
    /// recently seen contact is pinged with the lock released; a live
    /// incumbent keeps its slot, a dead one is replaced. Without a pinger a
    /// full bucket rejects the newcomer.
    pub async fn add_contact(
        &self,
        contact: Contact,
        pinger: Option<&dyn Pinger>,
    ) -> (bool, Contact) {
        if contact.node_id == self.me.node_id {
            return (false, contact);
        }

        let index = self.bucket_index(&contact.node_id);
        let outcome = self.buckets.write().await[index].insert(contact.clone());

        let incumbent = match outcome {
            BucketInsert::Added | BucketInsert::Refreshed => {
                debug!("Contact {} in bucket {}", contact, index);
                return (true, contact);
            }
            BucketInsert::Full { least_recent } => least_recent,
        };

        let pinger = match pinger {
            Some(pinger) => pinger,
            None => {
                debug!("Bucket {} full, rejecting {}", index, contact);
                return (false, contact);
            }
        };

        let alive = pinger.ping(&incumbent).await;
        let inserted = self.buckets.write().await[index].resolve_full(&incumbent, alive, contact.clone());
        if inserted {
            debug!("Evicted unresponsive {} for {}", incumbent, contact);
        } else {
            debug!("Bucket {} full and {} alive, rejecting {}", index, incumbent, contact);
        }
        (inserted, contact)
    }

    /// The `count` known contacts closest to `target`, closest first.
    ///
    /// Starts at the bucket `target` would fall into. Every deeper bucket
    /// shares that bucket's distance class to `target`, and each shallower
    /// bucket is strictly farther than the one below it, so buckets are
    /// visited in that order and the scan stops once `count` are held.
    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let buckets = self.buckets.read().await;
        let start = self.bucket_index(target);

        let mut candidates: Vec<Contact> = Vec::new();
        for bucket in &buckets[start..] {
            candidates.extend(bucket.get_with_distance(target));
        }
        for bucket in buckets[..start].iter().rev() {
            if candidates.len() >= count {
                break;
            }
            candidates.extend(bucket.get_with_distance(target));
        }
        drop(buckets);

        sort_by_distance(&mut candidates, target);
        candidates.truncate(count);
        candidates
    }

    /// Index of the bucket `id` belongs in. The local identifier itself maps
    /// to the last bucket.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.me
            .node_id
            .distance(id)
            .leading_bit()
            .unwrap_or(BUCKET_COUNT - 1)
    }

    /// Members of one bucket, most recently seen first.
    pub async fn bucket_contacts(&self, index: usize) -> Vec<Contact> {
        self.buckets
            .read()
            .await
            .get(index)
            .map(Bucket::dump)
            .unwrap_or_default()
    }

    /// Get the total number of contacts
    pub async fn contact_count(&self) -> usize {
        self.buckets.read().await.iter().map(Bucket::len).sum()
    }

    /// Every known contact, bucket by bucket.
    pub async fn dump(&self) -> Vec<Contact> {
        self.buckets
            .read()
            .await
            .iter()
            .flat_map(Bucket::dump)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dht::NodeAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedPinger {
        alive: bool,
        calls: AtomicUsize,
    }

    impl FixedPinger {
        fn new(alive: bool) -> Self {
            Self {
                alive,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Pinger for FixedPinger {
        async fn ping(&self, _contact: &Contact) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive
        }
    }

    fn contact_with(id: NodeId, port: u16) -> Contact {
        Contact::new(id, NodeAddress::new("127.0.0.1".parse().unwrap(), port, port))
    }

    /// Random identifier whose first bit is set: bucket 0 of a zero `me`.
    fn far_id() -> NodeId {
        let mut bytes: [u8; 20] = rand::random();
        bytes[0] |= 0x80;
        NodeId::new(bytes)
    }

    fn table(k: usize) -> RoutingTable {
        RoutingTable::new(contact_with(NodeId::zero(), 7000), k)
    }

    #[tokio::test]
    async fn test_routing_table() {
        let table = RoutingTable::new(contact_with(NodeId::random(), 7000), 20);

        for i in 0..5 {
            table.add_contact(contact_with(NodeId::random(), 8080 + i), None).await;
        }

        assert_eq!(table.contact_count().await, 5);
    }

    #[tokio::test]
    async fn test_never_adds_self() {
        let table = table(20);
        let me = table.me().clone();
        let (inserted, _) = table.add_contact(me, None).await;
        assert!(!inserted);
        assert_eq!(table.contact_count().await, 0);
    }

    #[test]
    fn test_bucket_index() {
        let table = table(20);

        assert_eq!(table.bucket_index(&far_id()), 0);

        let mut bytes = [0u8; 20];
        bytes[19] = 1;
        assert_eq!(table.bucket_index(&NodeId::new(bytes)), 159);

        bytes[19] = 0;
        bytes[1] = 0x20;
        assert_eq!(table.bucket_index(&NodeId::new(bytes)), 10);

        assert_eq!(table.bucket_index(&NodeId::zero()), BUCKET_COUNT - 1);
    }

    #[tokio::test]
    async fn test_full_bucket_without_pinger_rejects() {
        let table = table(3);
        for i in 0..3 {
            assert!(table.add_contact(contact_with(far_id(), 8000 + i), None).await.0);
        }

        let (inserted, _) = table.add_contact(contact_with(far_id(), 9000), None).await;
        assert!(!inserted);
        assert_eq!(table.contact_count().await, 3);
    }

    #[tokio::test]
    async fn test_full_bucket_evicts_dead_incumbent() {
        let table = table(3);
        let oldest = contact_with(far_id(), 8000);
        table.add_contact(oldest.clone(), None).await;
        table.add_contact(contact_with(far_id(), 8001), None).await;
        table.add_contact(contact_with(far_id(), 8002), None).await;

        let pinger = FixedPinger::new(false);
        let newcomer = contact_with(far_id(), 9000);
        let (inserted, _) = table.add_contact(newcomer.clone(), Some(&pinger)).await;

        assert!(inserted);
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 1);
        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket[0], newcomer);
        assert!(!bucket.contains(&oldest));
    }

    #[tokio::test]
    async fn test_full_bucket_keeps_live_incumbent() {
        let table = table(3);
        let oldest = contact_with(far_id(), 8000);
        table.add_contact(oldest.clone(), None).await;
        table.add_contact(contact_with(far_id(), 8001), None).await;
        table.add_contact(contact_with(far_id(), 8002), None).await;

        let pinger = FixedPinger::new(true);
        let newcomer = contact_with(far_id(), 9000);
        let (inserted, _) = table.add_contact(newcomer.clone(), Some(&pinger)).await;

        assert!(!inserted);
        let bucket = table.bucket_contacts(0).await;
        assert_eq!(bucket[0], oldest);
        assert!(!bucket.contains(&newcomer));
    }

    #[tokio::test]
    async fn test_find_closest() {
        let table = RoutingTable::new(contact_with(NodeId::random(), 7000), 20);
        for i in 0..10 {
            table.add_contact(contact_with(NodeId::random(), 8080 + i), None).await;
        }

        let target = NodeId::random();
        let closest = table.find_closest(&target, 3).await;
        assert_eq!(closest.len(), 3);

        let all = table.find_closest(&target, 100).await;
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_find_closest_matches_exhaustive_sort() {
        let table = RoutingTable::new(contact_with(NodeId::random(), 7000), 20);
        let mut known = Vec::new();
        for i in 0..200 {
            let contact = contact_with(NodeId::random(), 10000 + i);
            if table.add_contact(contact.clone(), None).await.0 {
                known.push(contact);
            }
        }

        for _ in 0..20 {
            let target = NodeId::random();
            let count = 7;
            let closest = table.find_closest(&target, count).await;
            assert_eq!(closest.len(), count);

            let mut ids: Vec<NodeId> = closest.iter().map(|c| c.node_id).collect();
            ids.dedup();
            assert_eq!(ids.len(), count, "no duplicates");

            let worst = closest
                .iter()
                .map(|c| c.node_id.distance(&target))
                .max()
                .unwrap();
            for other in known.iter().filter(|c| !ids.contains(&c.node_id)) {
                assert!(other.node_id.distance(&target) >= worst);
            }
        }
    }

    #[tokio::test]
    async fn test_find_closest_to_self_returns_nearest() {
        let table = table(20);
        let mut near = [0u8; 20];
        near[19] = 1;
        let near = contact_with(NodeId::new(near), 8000);
        table.add_contact(contact_with(far_id(), 8001), None).await;
        table.add_contact(near.clone(), None).await;

        let closest = table.find_closest(&NodeId::zero(), 1).await;
        assert_eq!(closest, vec![near]);
    }
}
