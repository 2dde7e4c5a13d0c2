use log::debug;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::network::dht::{sort_by_distance, Contact, DhtNode, NodeId};

type Round = Pin<Box<dyn Future<Output = Vec<Contact>> + Send>>;

/// State shared by every branch of one iterative lookup.
struct Search {
    dht: Arc<DhtNode>,
    target: NodeId,
    visited: Mutex<HashSet<NodeId>>,
}

impl Search {
    /// Query every member of `frontier` concurrently. Each answer's unseen
    /// contacts form the frontier of a new branch; all branches are awaited
    /// and everything they discovered is returned.
    fn round(self: Arc<Self>, frontier: Vec<Contact>) -> Round {
        Box::pin(async move {
            let (tx, mut rx) = mpsc::channel(frontier.len().max(1));
            for contact in frontier {
                let search = self.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = search.dht.find_contact_and_id(&search.target, &contact).await;
                    let _ = tx.send((contact, reply)).await;
                });
            }
            drop(tx);

            let mut discovered = Vec::new();
            let mut branches = Vec::new();

            while let Some((contact, reply)) = rx.recv().await {
                let (contacts, responder) = match reply {
                    Some(reply) => reply,
                    None => continue,
                };

                let answered = Contact::new(responder, contact.address);
                self.dht.routing().add_contact(answered, Some(&*self.dht)).await;

                let next = self.mark_unvisited(contacts).await;
                if !next.is_empty() {
                    discovered.extend(next.iter().cloned());
                    branches.push(tokio::spawn(self.clone().round(next)));
                }
            }

            for branch in branches {
                if let Ok(found) = branch.await {
                    discovered.extend(found);
                }
            }
            discovered
        })
    }

    /// Keep the contacts nobody has queried yet, marking them as queried.
    async fn mark_unvisited(&self, contacts: Vec<Contact>) -> Vec<Contact> {
        let me = self.dht.me().node_id;
        let width = self.dht.config().k;
        let mut visited = self.visited.lock().await;

        contacts
            .into_iter()
            .take(width)
            .filter(|contact| contact.node_id != me && visited.insert(contact.node_id))
            .collect()
    }
}

/// Iteratively locate the `k` nodes closest to `target`, closest first.
///
/// Starts from the `alpha` closest local contacts and keeps querying every
/// newly learned contact until no answer names anyone new.
pub async fn lookup_contact(dht: &Arc<DhtNode>, target: &NodeId) -> Vec<Contact> {
    let seeds = dht.routing().find_closest(target, dht.config().alpha).await;
    if seeds.is_empty() {
        debug!("Lookup for {} has no contacts to start from", target);
        return Vec::new();
    }

    let mut visited: HashSet<NodeId> = seeds.iter().map(|contact| contact.node_id).collect();
    visited.insert(dht.me().node_id);

    let search = Arc::new(Search {
        dht: dht.clone(),
        target: *target,
        visited: Mutex::new(visited),
    });

    let mut found = search.round(seeds.clone()).await;
    found.extend(seeds);
    sort_by_distance(&mut found, target);
    found.dedup_by(|a, b| a.node_id == b.node_id);
    found.truncate(dht.config().k);

    debug!("Lookup for {} settled on {} contacts", target, found.len());
    found
}

/// Locate the closest nodes to `hash` and collect the owners they know of,
/// without duplicates.
pub async fn lookup_data(dht: &Arc<DhtNode>, hash: &NodeId) -> Vec<Contact> {
    let closest = lookup_contact(dht, hash).await;

    let (tx, mut rx) = mpsc::channel(closest.len().max(1));
    for contact in closest {
        let dht = dht.clone();
        let tx = tx.clone();
        let hash = *hash;
        tokio::spawn(async move {
            let _ = tx.send(dht.find_data(&hash, &contact).await).await;
        });
    }
    drop(tx);

    let mut owners: Vec<Contact> = Vec::new();
    while let Some(found) = rx.recv().await {
        for owner in found {
            if !owners.iter().any(|known| known.node_id == owner.node_id) {
                owners.push(owner);
            }
        }
    }

    debug!("{} has {} known owners", hash, owners.len());
    owners
}
