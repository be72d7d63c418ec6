use courier::config::Config;
use courier::node::MessagingNode;
use replication::ReplicaProfile;

fn standalone_node(port: u16) -> MessagingNode {
    let mut config = Config::new("node-1", port).unwrap();
    config.peers = Vec::new();
    MessagingNode::with_profile(config, None, ReplicaProfile::reliable()).unwrap()
}

#[tokio::test]
async fn standalone_node_processes_messages_locally() {
    let node = standalone_node(42310);
    node.start().await.unwrap();

    assert_eq!(node.role(), "standalone");
    assert!(node.send_message("node-2", "first").await.unwrap());
    assert!(node.send_message("node-2", "second").await.unwrap());
    assert_eq!(node.stabilized_count().await, 2);
    assert_eq!(node.metrics().message_delivery_samples(), 2);

    node.stop();
}

#[tokio::test]
async fn inbound_transport_lines_become_replicated_messages() {
    let node = standalone_node(42320);
    node.start().await.unwrap();

    assert!(transport::send_message("127.0.0.1", 42320, "from outside").await);
    assert_eq!(node.message_count(), 1);
    assert_eq!(node.stabilized_count().await, 1);

    node.stop();
}

#[tokio::test]
async fn transport_port_answers_health_probes() {
    let node = standalone_node(42330);
    node.start().await.unwrap();

    let reply = transport::send_request("127.0.0.1", 42330, "PING").await;
    assert_eq!(reply.as_deref(), Some("PONG"));
    // Health probes never count as application messages.
    assert_eq!(node.message_count(), 0);

    node.stop();
}

#[tokio::test]
async fn invalid_send_input_is_rejected_at_the_boundary() {
    let node = standalone_node(42340);
    node.start().await.unwrap();

    assert!(node.send_message("", "content").await.is_err());
    assert!(node.send_message("node-2", "  ").await.is_err());
    assert_eq!(node.stabilized_count().await, 0);

    node.stop();
}
