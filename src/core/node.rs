use log::{debug, info, warn};
use std::sync::{Arc, Weak};

use crate::core::lookup;
use crate::core::Config;
use crate::network::dht::{Contact, DhtNode, NodeId};
use crate::storage::{HashUtils, KvEntry, RepublishFn};
use crate::utils::{DhtError, Result};

/// A running DHT participant and the operations applications use on it.
#[derive(Clone)]
pub struct Node {
    dht: Arc<DhtNode>,
}

impl Node {
    /// Validate `config`, bind the node's sockets and start serving.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let dht = DhtNode::bind(config).await?;
        Ok(Self { dht })
    }

    /// Join the network through the configured bootstrap peer, if any.
    pub async fn start(&self) -> Result<()> {
        match self.dht.config().bootstrap_peer {
            Some(peer) => self.bootstrap(peer).await,
            None => {
                info!("No bootstrap peer configured, starting a new network");
                Ok(())
            }
        }
    }

    pub fn me(&self) -> &Contact {
        self.dht.me()
    }

    pub fn config(&self) -> &Config {
        self.dht.config()
    }

    /// The network layer, for direct RPCs.
    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    pub async fn lookup_contact(&self, target: &NodeId) -> Vec<Contact> {
        lookup::lookup_contact(&self.dht, target).await
    }

    pub async fn lookup_data(&self, hash: &NodeId) -> Vec<Contact> {
        lookup::lookup_data(&self.dht, hash).await
    }

    /// Keep `data` locally and announce this node as its owner to the
    /// closest nodes. Returns the content key.
    pub async fn store(&self, data: &[u8]) -> NodeId {
        let hash = NodeId::from_content(data);
        self.dht.store().insert(hash, false, data.to_vec(), None).await;
        announce(&self.dht, hash).await;
        hash
    }

    /// Like `store`, but the content is never evicted and the announcement
    /// is repeated every republish interval.
    pub async fn store_pinned(&self, data: &[u8]) -> NodeId {
        let hash = NodeId::from_content(data);
        let republish = republisher(Arc::downgrade(&self.dht));
        self.dht
            .store()
            .insert(hash, true, data.to_vec(), Some(republish))
            .await;
        announce(&self.dht, hash).await;
        hash
    }

    /// Fetch the content under `hash` from `contact` and check it against
    /// the key.
    pub async fn download(&self, hash: &NodeId, contact: &Contact) -> Result<Vec<u8>> {
        let data = if contact.address == self.me().address {
            self.dht.store().lookup(hash).await?
        } else {
            self.dht.transfer_data(hash, contact).await?
        };

        let actual = NodeId::from_content(&data);
        if actual != *hash {
            return Err(DhtError::ChecksumMismatch {
                expected: *hash,
                actual,
            });
        }

        info!("Downloaded {} ({} bytes) from {}", hash, data.len(), contact);
        Ok(data)
    }

    /// Get the content under `hash` from wherever it lives, trying each
    /// owner in turn.
    pub async fn fetch(&self, hash: &NodeId) -> Result<Vec<u8>> {
        if let Ok(data) = self.dht.store().lookup(hash).await {
            if HashUtils::verify_data(&data, hash) {
                return Ok(data);
            }
        }

        let mut last_error = DhtError::NotFound(*hash);
        for owner in self.lookup_data(hash).await {
            match self.download(hash, &owner).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!("Download of {} from {} failed: {}", hash, owner, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub async fn pin(&self, hash: &NodeId) -> Result<()> {
        self.dht.store().pin(hash).await
    }

    pub async fn unpin(&self, hash: &NodeId) -> Result<()> {
        self.dht.store().unpin(hash).await
    }

    pub async fn dump_store(&self) -> Vec<(NodeId, KvEntry)> {
        self.dht.store().dump().await
    }

    pub async fn dump_contacts(&self) -> Vec<Contact> {
        self.dht.routing().dump().await
    }

    pub fn shutdown(&self) {
        self.dht.shutdown();
    }
}

/// Tell the nodes closest to `hash` that this node owns it.
async fn announce(dht: &Arc<DhtNode>, hash: NodeId) {
    let closest = lookup::lookup_contact(dht, &hash).await;

    let mut tasks = Vec::new();
    for contact in closest {
        let dht = dht.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dht.store_data(&hash, &contact).await {
                debug!("STORE_DATA {} to {} failed: {}", hash, contact, e);
                return false;
            }
            true
        }));
    }

    let mut announced = 0;
    for task in tasks {
        if let Ok(true) = task.await {
            announced += 1;
        }
    }
    info!("Announced {} to {} nodes", hash, announced);
}

fn republisher(dht: Weak<DhtNode>) -> RepublishFn {
    Arc::new(move |hash: NodeId| {
        if let Some(dht) = dht.upgrade() {
            tokio::spawn(async move { announce(&dht, hash).await });
        }
    })
}
