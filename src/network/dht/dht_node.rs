use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

use crate::core::config::Config;
use crate::network::transport::{Connection, Protocol, Transport, MAX_DATAGRAM_SIZE};
use crate::storage::{HashUtils, KvStore};
use crate::utils::{DhtError, Result};

use super::contact::{Contact, NodeAddress};
use super::node_id::NodeId;
use super::routing_table::{Pinger, RoutingTable};
use super::rpc::{decode_payload, encode_payload, MessageType, NetworkMessage};

/// The network side of a DHT node: its sockets, routing table and store,
/// plus the request/response primitives the lookup layer is built from.
pub struct DhtNode {
    me: Contact,
    config: Config,
    routing: RoutingTable,
    store: KvStore,
    socket: UdpSocket,
    shutdown: watch::Sender<bool>,
}

impl DhtNode {
    /// Bind both listeners and start serving. Ports set to 0 in `config` are
    /// replaced by the ones the OS picked, so `me()` is always reachable.
    pub async fn bind(config: Config) -> Result<Arc<Self>> {
        let listener = Transport::listen(SocketAddr::new(config.host, config.tcp_port)).await?;
        let socket = Transport::bind_udp(SocketAddr::new(config.host, config.udp_port)).await?;

        let address = NodeAddress::new(
            config.host,
            listener.local_addr()?.port(),
            socket.local_addr()?.port(),
        );
        let me = Contact::new(NodeId::random(), address);
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            routing: RoutingTable::new(me.clone(), config.k),
            store: KvStore::new(config.eviction_ttl, config.republish_interval),
            me,
            config,
            socket,
            shutdown,
        });

        tokio::spawn(node.clone().accept_loop(listener, node.shutdown.subscribe()));
        tokio::spawn(node.clone().datagram_loop(node.shutdown.subscribe()));

        info!("DHT node {} listening on {}", node.me.node_id, node.me.address);
        Ok(node)
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Stop both listen loops. Outstanding handlers finish on their own.
    pub fn shutdown(&self) {
        if self.shutdown.send(true).is_ok() {
            info!("DHT node {} shutting down", self.me.node_id);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_stream(stream).await {
                                warn!("TCP exchange with {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("TCP listener on {} stopped", self.me.address.tcp_addr());
    }

    async fn datagram_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; self.config.receive_buffer_size.min(MAX_DATAGRAM_SIZE)];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => {
                        let data = buffer[..len].to_vec();
                        let node = self.clone();
                        tokio::spawn(async move { node.handle_datagram(data, from).await });
                    }
                    Err(e) => {
                        error!("UDP receive failed: {}", e);
                        sleep(self.config.connection_retry_delay).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("UDP listener on {} stopped", self.me.address.udp_addr());
    }

    /// Record the sender of an inbound message. When its bucket is full the
    /// ping of the oldest member runs on its own task, so the answer to the
    /// sender is not held back by it.
    async fn observe(self: &Arc<Self>, origin: &Contact) {
        if origin.node_id == self.me.node_id {
            return;
        }

        let (inserted, contact) = self.routing.add_contact(origin.clone(), None).await;
        if !inserted {
            let node = self.clone();
            tokio::spawn(async move {
                node.routing.add_contact(contact, Some(&*node)).await;
            });
        }
    }

    async fn handle_datagram(self: &Arc<Self>, data: Vec<u8>, from: SocketAddr) {
        let message = match NetworkMessage::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };
        debug!("{} received {}", self.me.address, message);

        self.observe(&message.origin).await;

        let response = match message.msg_type {
            MessageType::Ping => Ok(Some(message.reply(MessageType::Pong, self.me.clone(), Vec::new()))),
            MessageType::FindContact => self.handle_find_contact(&message).await.map(Some),
            MessageType::FindData => self.handle_find_data(&message).await.map(Some),
            MessageType::StoreData => self.handle_store_data(&message).await.map(|_| None),
            other => {
                warn!("Unexpected {} datagram from {}", other.as_str(), from);
                Ok(None)
            }
        };

        match response {
            Ok(Some(reply)) => {
                let sent = match reply.encode() {
                    Ok(bytes) => self.socket.send_to(&bytes, from).await.map_err(DhtError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!("Failed to answer {} from {}: {}", message.msg_type.as_str(), from, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping {} from {}: {}", message.msg_type.as_str(), from, e),
        }
    }

    async fn handle_find_contact(&self, message: &NetworkMessage) -> Result<NetworkMessage> {
        let target: NodeId = message.payload()?;
        let contacts = self.routing.find_closest(&target, self.config.k).await;
        debug!("Answering FIND_CONTACT {} with {} contacts", target, contacts.len());
        Ok(message.reply(MessageType::FindContact, self.me.clone(), encode_payload(&contacts)?))
    }

    async fn handle_find_data(&self, message: &NetworkMessage) -> Result<NetworkMessage> {
        let key: NodeId = message.payload()?;
        let data = match self.store.lookup(&key).await {
            // Holding the content itself makes this node the owner.
            Ok(value) if HashUtils::verify_data(&value, &key) => encode_payload(&vec![self.me.clone()])?,
            Ok(owners) => owners,
            Err(_) => Vec::new(),
        };
        Ok(message.reply(MessageType::FindData, self.me.clone(), data))
    }

    /// Append the origin to the owner list under the key.
    async fn handle_store_data(&self, message: &NetworkMessage) -> Result<()> {
        let key: NodeId = message.payload()?;
        let origin = message.origin.clone();

        let updated = self
            .store
            .update(key, |current| {
                let mut owners: Vec<Contact> = match current {
                    Some(entry) if HashUtils::verify_data(&entry.data, &key) => return None,
                    Some(entry) => decode_payload(&entry.data).unwrap_or_else(|e| {
                        warn!("Discarding corrupt owner list under {}: {}", key, e);
                        Vec::new()
                    }),
                    None => Vec::new(),
                };
                owners.retain(|owner| owner.node_id != origin.node_id);
                owners.push(origin.clone());
                encode_payload(&owners).ok()
            })
            .await;

        match updated {
            Some(_) => debug!("{} announced as owner of {}", origin, key),
            None => debug!("Ignoring STORE_DATA for {}: content held locally", key),
        }
        Ok(())
    }

    async fn handle_stream(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let frame = timeout(
            self.config.connection_timeout,
            Transport::receive_data(&mut stream, self.config.receive_buffer_size),
        )
        .await
        .map_err(|_| DhtError::NoResponse("idle TCP connection".to_string()))??;
        let message = NetworkMessage::decode(&frame)?;
        debug!("{} received {}", self.me.address, message);

        self.observe(&message.origin).await;

        if message.msg_type != MessageType::TransferData {
            return Err(DhtError::MalformedMessage(format!(
                "unexpected {} over TCP",
                message.msg_type.as_str()
            )));
        }

        let key: NodeId = message.payload()?;
        let data = self.store.lookup(&key).await?;
        if !HashUtils::verify_data(&data, &key) {
            return Err(DhtError::NotFound(key));
        }

        let response = message.reply(MessageType::TransferData, self.me.clone(), data);
        Transport::send_data(&mut stream, &response.encode()?).await?;
        info!("Served {} to {}", key, message.origin);
        Ok(())
    }

    /// Open a channel to `contact` and write `message` on it.
    pub async fn send_message(
        &self,
        protocol: Protocol,
        message: &NetworkMessage,
        contact: &Contact,
    ) -> Result<Connection> {
        if contact.address == self.me.address {
            return Err(DhtError::SendToSelf(contact.address.to_string()));
        }

        let addr = match protocol {
            Protocol::Udp => contact.address.udp_addr(),
            Protocol::Tcp => contact.address.tcp_addr(),
        };

        let mut connection = Transport::connect(protocol, addr, self.config.connection_timeout).await?;
        connection.send(&message.encode()?).await?;
        debug!("{} sent {} to {}", self.me.address, message.msg_type.as_str(), addr);
        Ok(connection)
    }

    /// Send `message` and wait for the response carrying the same `rpc_id`.
    ///
    /// Gives up after the connection timeout. A UDP receive error is retried
    /// after the retry delay; a datagram for another RPC is skipped.
    pub async fn send_receive(
        &self,
        protocol: Protocol,
        message: &NetworkMessage,
        contact: &Contact,
    ) -> Option<NetworkMessage> {
        let mut connection = match self.send_message(protocol, message, contact).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("{} to {} not sent: {}", message.msg_type.as_str(), contact, e);
                return None;
            }
        };

        let limit = match protocol {
            Protocol::Udp => self.config.receive_buffer_size,
            Protocol::Tcp => self.config.max_transfer_size,
        };

        let exchange = async {
            loop {
                let bytes = match connection.receive(limit).await {
                    Ok(bytes) => bytes,
                    Err(e) if protocol == Protocol::Udp => {
                        debug!("Receive from {} failed, retrying: {}", contact, e);
                        sleep(self.config.connection_retry_delay).await;
                        continue;
                    }
                    Err(e) => {
                        debug!("Receive from {} failed: {}", contact, e);
                        return None;
                    }
                };

                match NetworkMessage::decode(&bytes) {
                    Ok(response) if response.rpc_id == message.rpc_id => return Some(response),
                    Ok(response) => {
                        warn!("Discarding response for another RPC from {}", response.origin);
                        if protocol == Protocol::Tcp {
                            return None;
                        }
                    }
                    Err(e) => {
                        warn!("Malformed response from {}: {}", contact, e);
                        return None;
                    }
                }
            }
        };

        match timeout(self.config.connection_timeout, exchange).await {
            Ok(response) => response,
            Err(_) => {
                debug!("{} to {} timed out", message.msg_type.as_str(), contact);
                None
            }
        }
    }

    /// True when `contact` answers a PING with a PONG in time.
    pub async fn send_ping(&self, contact: &Contact) -> bool {
        if contact.address == self.me.address {
            return true;
        }

        let request = NetworkMessage::request(MessageType::Ping, self.me.clone(), Vec::new());
        matches!(
            self.send_receive(Protocol::Udp, &request, contact).await,
            Some(response) if response.msg_type == MessageType::Pong
        )
    }

    /// Ask `receiver` for its contacts closest to `target`. Also returns the
    /// identifier the receiver answered with, or `None` if it never answered.
    pub async fn find_contact_and_id(
        &self,
        target: &NodeId,
        receiver: &Contact,
    ) -> Option<(Vec<Contact>, NodeId)> {
        let payload = encode_payload(target).ok()?;
        let request = NetworkMessage::request(MessageType::FindContact, self.me.clone(), payload);
        let response = self.send_receive(Protocol::Udp, &request, receiver).await?;

        if response.msg_type != MessageType::FindContact {
            warn!("Expected FIND_CONTACT from {}, got {}", receiver, response.msg_type.as_str());
            return None;
        }

        let contacts = response.payload::<Vec<Contact>>().unwrap_or_else(|e| {
            warn!("Unreadable contact list from {}: {}", response.origin, e);
            Vec::new()
        });
        Some((contacts, response.origin.node_id))
    }

    /// Ask `receiver` for its contacts closest to `target`.
    pub async fn find_contact(&self, target: &NodeId, receiver: &Contact) -> Vec<Contact> {
        self.find_contact_and_id(target, receiver)
            .await
            .map(|(contacts, _)| contacts)
            .unwrap_or_default()
    }

    /// Ask `receiver` who owns `key`. Empty when it knows no owners or does
    /// not answer.
    pub async fn find_data(&self, key: &NodeId, receiver: &Contact) -> Vec<Contact> {
        let payload = match encode_payload(key) {
            Ok(payload) => payload,
            Err(_) => return Vec::new(),
        };
        let request = NetworkMessage::request(MessageType::FindData, self.me.clone(), payload);

        let response = match self.send_receive(Protocol::Udp, &request, receiver).await {
            Some(response) if response.msg_type == MessageType::FindData => response,
            _ => return Vec::new(),
        };
        if response.data.is_empty() {
            return Vec::new();
        }

        response.payload().unwrap_or_else(|e| {
            warn!("Unreadable owner list from {}: {}", response.origin, e);
            Vec::new()
        })
    }

    /// Announce this node to `receiver` as an owner of `key`. No response is
    /// expected.
    pub async fn store_data(&self, key: &NodeId, receiver: &Contact) -> Result<()> {
        let request = NetworkMessage::request(MessageType::StoreData, self.me.clone(), encode_payload(key)?);
        self.send_message(Protocol::Udp, &request, receiver).await?;
        Ok(())
    }

    /// Fetch the raw bytes `receiver` holds under `key` over TCP. The caller
    /// verifies them against the key.
    pub async fn transfer_data(&self, key: &NodeId, receiver: &Contact) -> Result<Vec<u8>> {
        let request =
            NetworkMessage::request(MessageType::TransferData, self.me.clone(), encode_payload(key)?);

        match self.send_receive(Protocol::Tcp, &request, receiver).await {
            Some(response) if response.msg_type == MessageType::TransferData => Ok(response.data),
            Some(response) => Err(DhtError::MalformedMessage(format!(
                "expected TRANSFER_DATA, got {}",
                response.msg_type.as_str()
            ))),
            None => Err(DhtError::NoResponse(receiver.to_string())),
        }
    }
}

#[async_trait]
impl Pinger for DhtNode {
    async fn ping(&self, contact: &Contact) -> bool {
        self.send_ping(contact).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> Config {
        Config {
            connection_timeout: Duration::from_millis(500),
            connection_retry_delay: Duration::from_millis(50),
            ..Config::local()
        }
    }

    async fn pair() -> (Arc<DhtNode>, Arc<DhtNode>) {
        let a = DhtNode::bind(quick_config()).await.unwrap();
        let b = DhtNode::bind(quick_config()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_bind_reports_actual_ports() {
        let node = DhtNode::bind(Config::local()).await.unwrap();
        assert_ne!(node.me().address.tcp_port, 0);
        assert_ne!(node.me().address.udp_port, 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_ping_records_the_caller() {
        let (a, b) = pair().await;

        assert!(a.send_ping(b.me()).await);
        assert!(a.send_ping(a.me()).await);

        // b records a as soon as the PING arrives.
        assert_eq!(b.routing().dump().await, vec![a.me().clone()]);
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_ping_dead_contact_times_out() {
        let a = DhtNode::bind(quick_config()).await.unwrap();
        let dead = DhtNode::bind(quick_config()).await.unwrap();
        let dead_contact = dead.me().clone();
        dead.shutdown();
        drop(dead);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!a.send_ping(&dead_contact).await);
    }

    #[tokio::test]
    async fn test_send_to_self_is_refused() {
        let node = DhtNode::bind(quick_config()).await.unwrap();
        let request = NetworkMessage::request(MessageType::Ping, node.me().clone(), Vec::new());
        let result = node.send_message(Protocol::Udp, &request, node.me()).await;
        assert!(matches!(result, Err(DhtError::SendToSelf(_))));
    }

    #[tokio::test]
    async fn test_find_contact_returns_receivers_neighbours() {
        let (a, b) = pair().await;
        let c = DhtNode::bind(quick_config()).await.unwrap();
        b.routing().add_contact(c.me().clone(), None).await;

        let (contacts, id) = a.find_contact_and_id(&NodeId::random(), b.me()).await.unwrap();
        assert_eq!(id, b.me().node_id);
        assert!(contacts.contains(c.me()));
        // The requester was observed before the answer was built.
        assert!(contacts.contains(a.me()));
    }

    #[tokio::test]
    async fn test_store_data_then_find_data() {
        let (a, b) = pair().await;
        let key = NodeId::from_content(b"some content");

        assert!(a.find_data(&key, b.me()).await.is_empty());

        a.store_data(&key, b.me()).await.unwrap();
        a.store_data(&key, b.me()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.find_data(&key, b.me()).await, vec![a.me().clone()]);
    }

    #[tokio::test]
    async fn test_content_holder_answers_for_itself() {
        let (a, b) = pair().await;
        let content = b"held content".to_vec();
        let key = NodeId::from_content(&content);
        b.store().insert(key, false, content.clone(), None).await;

        assert_eq!(a.find_data(&key, b.me()).await, vec![b.me().clone()]);

        a.store_data(&key, b.me()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.store().lookup(&key).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_transfer_data() {
        let (a, b) = pair().await;
        let content = b"transfer me".to_vec();
        let key = NodeId::from_content(&content);
        b.store().insert(key, false, content.clone(), None).await;

        assert_eq!(a.transfer_data(&key, b.me()).await.unwrap(), content);
        assert!(matches!(
            a.transfer_data(&NodeId::random(), b.me()).await,
            Err(DhtError::NoResponse(_))
        ));
    }

    async fn fake_peer() -> (UdpSocket, Contact) {
        let socket = Transport::bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let contact = Contact::new(
            NodeId::random(),
            NodeAddress::new("127.0.0.1".parse().unwrap(), 1, port),
        );
        (socket, contact)
    }

    #[tokio::test]
    async fn test_stale_rpc_id_is_skipped() {
        let node = DhtNode::bind(quick_config()).await.unwrap();
        let (fake, fake_contact) = fake_peer().await;

        let responder = fake_contact.clone();
        let server = tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let (len, from) = fake.recv_from(&mut buffer).await.unwrap();
            let request = NetworkMessage::decode(&buffer[..len]).unwrap();

            let stale = NetworkMessage::request(MessageType::Pong, responder.clone(), Vec::new());
            fake.send_to(&stale.encode().unwrap(), from).await.unwrap();
            let pong = request.reply(MessageType::Pong, responder, Vec::new());
            fake.send_to(&pong.encode().unwrap(), from).await.unwrap();
        });

        let request = NetworkMessage::request(MessageType::Ping, node.me().clone(), Vec::new());
        let response = node
            .send_receive(Protocol::Udp, &request, &fake_contact)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(response.rpc_id, request.rpc_id);
        assert_eq!(response.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_malformed_response_ends_exchange() {
        let node = DhtNode::bind(quick_config()).await.unwrap();
        let (fake, fake_contact) = fake_peer().await;

        let server = tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let (_, from) = fake.recv_from(&mut buffer).await.unwrap();
            fake.send_to(&[0xFF, 0xFF, 0xFF], from).await.unwrap();
        });

        let request = NetworkMessage::request(MessageType::Ping, node.me().clone(), Vec::new());
        assert!(node.send_receive(Protocol::Udp, &request, &fake_contact).await.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_tcp_connection_is_closed() {
        use tokio::io::AsyncReadExt;

        let config = Config {
            connection_timeout: Duration::from_millis(200),
            ..Config::local()
        };
        let node = DhtNode::bind(config).await.unwrap();
        let mut stream = TcpStream::connect(node.me().address.tcp_addr()).await.unwrap();

        let mut buffer = [0u8; 16];
        let read = timeout(Duration::from_secs(2), stream.read(&mut buffer))
            .await
            .expect("server closes the idle connection");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    /// Send `msg_type` with an undecodable payload and report whether any
    /// answer came back.
    async fn answers_garbage(node: &DhtNode, target: &Contact, msg_type: MessageType) -> bool {
        let request = NetworkMessage::request(msg_type, node.me().clone(), vec![0xFF, 0x01]);
        node.send_receive(Protocol::Udp, &request, target).await.is_some()
    }

    #[tokio::test]
    async fn test_garbage_payloads_get_no_answer() {
        let (a, b) = pair().await;

        assert!(!answers_garbage(&a, b.me(), MessageType::FindContact).await);
        assert!(!answers_garbage(&a, b.me(), MessageType::FindData).await);
        assert!(!answers_garbage(&a, b.me(), MessageType::StoreData).await);
        assert!(b.store().is_empty().await);

        assert!(a.send_ping(b.me()).await);
    }

    #[tokio::test]
    async fn test_tcp_only_serves_transfers() {
        let (a, b) = pair().await;
        let content = b"only by transfer".to_vec();
        let key = NodeId::from_content(&content);
        b.store().insert(key, false, content.clone(), None).await;

        let request = NetworkMessage::request(MessageType::FindData, a.me().clone(), encode_payload(&key).unwrap());
        assert!(a.send_receive(Protocol::Tcp, &request, b.me()).await.is_none());

        let request = NetworkMessage::request(MessageType::Ping, a.me().clone(), Vec::new());
        assert!(a.send_receive(Protocol::Tcp, &request, b.me()).await.is_none());

        assert_eq!(a.transfer_data(&key, b.me()).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_full_bucket_does_not_delay_answers() {
        let config = Config {
            k: 1,
            ..quick_config()
        };
        let b = DhtNode::bind(config).await.unwrap();
        let a = DhtNode::bind(quick_config()).await.unwrap();

        // A dead contact sharing a's bucket in b's table.
        let mut bytes = *a.me().node_id.as_bytes();
        bytes[19] ^= 0x01;
        let (gone, _) = fake_peer().await;
        let dead = Contact::new(
            NodeId::new(bytes),
            NodeAddress::new("127.0.0.1".parse().unwrap(), 1, gone.local_addr().unwrap().port()),
        );
        drop(gone);
        assert!(b.routing().add_contact(dead.clone(), None).await.0);

        let started = tokio::time::Instant::now();
        assert!(a.send_ping(b.me()).await);
        assert!(started.elapsed() < Duration::from_millis(300));

        // The eviction completes once the dead contact's ping times out.
        tokio::time::sleep(Duration::from_millis(900)).await;
        let known = b.routing().dump().await;
        assert!(known.contains(a.me()));
        assert!(!known.contains(&dead));
    }
}
