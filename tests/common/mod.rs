#![allow(dead_code)]

use mini_kad::{Config, Node};
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        connection_timeout: Duration::from_secs(1),
        connection_retry_delay: Duration::from_millis(100),
        ..Config::local()
    }
}

pub async fn spawn_nodes(count: usize, config: &Config) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(Node::new(config.clone()).await.expect("node binds"));
    }
    nodes
}

/// Link `a` and `b` in both routing tables.
pub async fn link(a: &Node, b: &Node) {
    a.dht().routing().add_contact(b.me().clone(), None).await;
    b.dht().routing().add_contact(a.me().clone(), None).await;
}

/// A `side` x `side` grid where each node only knows its right and lower
/// neighbours (and they know it).
pub async fn grid(side: usize, config: &Config) -> Vec<Node> {
    let nodes = spawn_nodes(side * side, config).await;
    for row in 0..side {
        for col in 0..side {
            let here = row * side + col;
            if col + 1 < side {
                link(&nodes[here], &nodes[here + 1]).await;
            }
            if row + 1 < side {
                link(&nodes[here], &nodes[here + side]).await;
            }
        }
    }
    nodes
}

/// Wait for fire-and-forget datagrams to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

pub fn shutdown_all(nodes: &[Node]) {
    for node in nodes {
        node.shutdown();
    }
}
