use log::{debug, info};
use rand::seq::SliceRandom;

use crate::core::Node;
use crate::network::dht::{Contact, NodeAddress, NodeId};
use crate::utils::{DhtError, Result};

impl Node {
    /// Join the network through the peer listening at `address`.
    ///
    /// The peer's identifier is not known up front, so it is addressed with a
    /// placeholder and learned from its answer to a FIND_CONTACT for our own
    /// identifier. Every bucket farther out than the peer's is then refreshed
    /// through one of its members.
    pub async fn bootstrap(&self, address: NodeAddress) -> Result<()> {
        let dht = self.dht();
        let me = dht.me().node_id;
        let placeholder = Contact::new(NodeId::zero(), address);

        let (candidates, boot_id) = dht
            .find_contact_and_id(&me, &placeholder)
            .await
            .ok_or_else(|| DhtError::BootstrapFailed(format!("no answer from {}", address)))?;

        if boot_id == me {
            info!("Bootstrap peer {} is this node", address);
            return Ok(());
        }

        for candidate in candidates {
            dht.routing().add_contact(candidate, None).await;
        }
        let boot = Contact::new(boot_id, address);
        dht.routing().add_contact(boot.clone(), Some(&**dht)).await;

        let boot_index = dht.routing().bucket_index(&boot_id);
        let mut refreshed = 0;
        for index in 0..boot_index {
            let members = dht.routing().bucket_contacts(index).await;
            let member = match members.choose(&mut rand::thread_rng()) {
                Some(member) => member.clone(),
                None => continue,
            };

            let found = dht.find_contact(&member.node_id, &member).await;
            debug!("Refreshed bucket {} via {}: {} contacts", index, member, found.len());
            for contact in found {
                dht.routing().add_contact(contact, None).await;
            }
            refreshed += 1;
        }

        info!(
            "Bootstrapped via {} ({} buckets refreshed, {} contacts known)",
            boot,
            refreshed,
            dht.routing().contact_count().await
        );
        Ok(())
    }
}
