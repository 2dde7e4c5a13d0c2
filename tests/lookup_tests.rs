mod common;

use common::{grid, link, shutdown_all, spawn_nodes, test_config};

#[tokio::test]
async fn lookup_contact_finds_every_corner_of_a_grid() {
    let nodes = grid(6, &test_config()).await;
    let first = &nodes[0];
    let last = &nodes[nodes.len() - 1];

    let found = first.lookup_contact(&last.me().node_id).await;
    assert_eq!(found.first(), Some(last.me()));

    let found = last.lookup_contact(&first.me().node_id).await;
    assert_eq!(found.first(), Some(first.me()));

    shutdown_all(&nodes);
}

#[tokio::test]
async fn lookup_contact_finds_any_node_from_any_node() {
    let nodes = grid(4, &test_config()).await;

    for (i, from) in nodes.iter().enumerate() {
        let to = &nodes[(i * 7 + 5) % nodes.len()];
        if to.me() == from.me() {
            continue;
        }
        let found = from.lookup_contact(&to.me().node_id).await;
        assert_eq!(found.first(), Some(to.me()), "lookup from node {}", i);
    }

    shutdown_all(&nodes);
}

#[tokio::test]
async fn lookup_returns_at_most_k_sorted_contacts() {
    let config = mini_kad::Config {
        k: 5,
        ..test_config()
    };
    let nodes = spawn_nodes(12, &config).await;
    for pair in nodes.windows(2) {
        link(&pair[0], &pair[1]).await;
    }

    let target = mini_kad::NodeId::random();
    let found = nodes[0].lookup_contact(&target).await;
    assert_eq!(found.len(), 5);
    for pair in found.windows(2) {
        assert!(pair[0].node_id.distance(&target) < pair[1].node_id.distance(&target));
    }

    shutdown_all(&nodes);
}
