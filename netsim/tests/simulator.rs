use std::time::Duration;

use netsim::NetworkLink;
use netsim::Simulator;

const SHORT: Duration = Duration::from_millis(200);

#[tokio::test]
async fn edge_properties_round_trip() {
    let sim = Simulator::new(1);
    sim.topology().add_edge("a", "b", NetworkLink::new(Duration::from_millis(17), 0.42));

    let edge = sim.topology().get_edge("a", "b").expect("edge must exist after add_edge");
    assert_eq!(edge.latency, Duration::from_millis(17));
    assert_eq!(edge.reliability, 0.42);
}

#[tokio::test]
async fn reliable_link_delivers_every_accepted_send() {
    let sim = Simulator::new(2);
    sim.topology().add_edge("a", "b", NetworkLink::reliable(Duration::from_millis(5)));

    let a = sim.node("a").await;
    let b = sim.node("b").await;

    for i in 0..20u32 {
        let accepted = a.send("b", i.to_be_bytes().to_vec(), SHORT).await;
        assert!(accepted, "send {} must be accepted: reliable edge exists", i);
    }

    for i in 0..20u32 {
        let msg = b.receive(SHORT).await.expect("reliable link must deliver every accepted send");
        assert_eq!(msg.from, "a");
        assert_eq!(msg.to, "b");
        assert_eq!(&msg.payload[..], &i.to_be_bytes()[..]);
    }
}

#[tokio::test]
async fn send_with_no_edge_is_rejected() {
    let sim = Simulator::new(3);
    let a = sim.node("a").await;

    let accepted = a.send("b", b"hello".to_vec(), SHORT).await;
    assert!(!accepted, "send over a nonexistent edge must not be accepted");
}

#[tokio::test]
async fn lossy_link_drops_some_accepted_sends() {
    let sim = Simulator::new(4);
    sim.topology().add_edge("a", "b", NetworkLink::new(Duration::from_millis(1), 0.3));

    let a = sim.node("a").await;
    let b = sim.node("b").await;

    let mut accepted = 0u32;
    for i in 0..200u32 {
        if a.send("b", i.to_be_bytes().to_vec(), SHORT).await {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 200, "acceptance does not depend on the reliability roll");

    let mut delivered = 0u32;
    while b.receive(Duration::from_millis(50)).await.is_ok() {
        delivered += 1;
    }
    assert!(delivered < 200, "a 0.3-reliability link must drop at least some of 200 sends");
    assert!(delivered > 0, "a 0.3-reliability link must still deliver some of 200 sends");
}

#[tokio::test]
async fn concurrent_accept_then_connect_both_resolve() {
    let sim = Simulator::new(5);
    sim.topology().add_edge("client", "server", NetworkLink::reliable(Duration::from_millis(2)));

    let server = sim.node("server").await;
    let client = sim.node("client").await;

    let listener = server.bind(9000).await.expect("bind must succeed");

    let accept = tokio::spawn(async move { listener.accept(SHORT).await });
    // Give `accept` a chance to start waiting before `connect` races in.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let connect_result = client.connect("server", 9000, 9001, SHORT).await;

    let accept_result = accept.await.expect("accept task must not panic");

    let server_side = accept_result.expect("accept must resolve once connect arrives");
    let client_side = connect_result.expect("connect must resolve once accept is waiting");

    assert_eq!(client_side.remote_endpoint().address, "server");
    assert_eq!(client_side.remote_endpoint().port, 9000);
    assert_eq!(server_side.remote_endpoint().address, "client");
}

#[tokio::test]
async fn concurrent_connect_then_accept_both_resolve() {
    let sim = Simulator::new(6);
    sim.topology().add_edge("client", "server", NetworkLink::reliable(Duration::from_millis(2)));

    let server = sim.node("server").await;
    let client = sim.node("client").await;

    let listener = server.bind(9100).await.expect("bind must succeed");

    // `connect` races in before anyone calls `accept`; its request must sit in the listener's
    // backlog rather than fail.
    let connect = tokio::spawn(async move { client.connect("server", 9100, 9101, SHORT).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let accept_result = listener.accept(SHORT).await;

    let connect_result = connect.await.expect("connect task must not panic");

    assert!(accept_result.is_ok(), "accept must resolve once the queued connect is found");
    assert!(connect_result.is_ok(), "connect must resolve once accepted");
}

#[tokio::test]
async fn established_connection_delivers_frames_in_order() {
    let sim = Simulator::new(7);
    sim.topology().add_edge("client", "server", NetworkLink::reliable(Duration::from_millis(1)));
    sim.topology().add_edge("server", "client", NetworkLink::reliable(Duration::from_millis(1)));

    let server = sim.node("server").await;
    let client = sim.node("client").await;

    let listener = server.bind(9200).await.expect("bind must succeed");
    let accept = tokio::spawn(async move { listener.accept(SHORT).await });
    let client_conn = client.connect("server", 9200, 9201, SHORT).await.expect("connect must succeed");
    let server_conn = accept.await.expect("accept task must not panic").expect("accept must succeed");

    for i in 0..10u8 {
        assert!(client_conn.write(vec![i], SHORT).await.expect("write must not time out"));
    }

    for i in 0..10u8 {
        let frame = server_conn.read(SHORT).await.expect("established connection must deliver every frame");
        assert_eq!(&frame[..], &[i][..]);
    }
}

#[tokio::test]
async fn pooled_connection_is_reused_while_open() {
    let sim = Simulator::new(8);
    sim.topology().add_edge("client", "server", NetworkLink::reliable(Duration::from_millis(1)));

    let server = sim.node("server").await;
    let client = sim.node("client").await;

    let listener = server.bind(9300).await.expect("bind must succeed");
    let accept = tokio::spawn(async move { listener.accept(SHORT).await });
    let conn = client.connect("server", 9300, 9301, SHORT).await.expect("connect must succeed");
    accept.await.expect("accept task must not panic").expect("accept must succeed");

    let first_id = conn.id();
    client.return_connection(conn).await;

    let reused = client.connect("server", 9300, 9301, SHORT).await.expect("connect must reuse the pool");
    assert_eq!(reused.id(), first_id, "a still-open pooled connection must be handed back as-is");

    client.return_connection(reused).await;
    let reused_again = client.connect("server", 9300, 9301, SHORT).await.expect("connect must reuse the pool again");
    assert_eq!(reused_again.id(), first_id, "repeated return/borrow cycles keep reusing the same connection");
}

#[tokio::test]
async fn closed_connection_is_not_pooled() {
    let sim = Simulator::new(9);
    sim.topology().add_edge("client", "server", NetworkLink::reliable(Duration::from_millis(1)));

    let server = sim.node("server").await;
    let client = sim.node("client").await;

    let listener = server.bind(9400).await.expect("bind must succeed");
    let accept = tokio::spawn(async move { listener.accept(SHORT).await });
    let conn = client.connect("server", 9400, 9401, SHORT).await.expect("connect must succeed");
    accept.await.expect("accept task must not panic").expect("accept must succeed");

    let first_id = conn.id();
    conn.close();
    client.return_connection(conn).await;

    // The original listener went out of scope once `accept` returned; give its drop-triggered
    // unregister task a moment to run before reusing the port.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let listener2 = server.bind(9400).await.expect("port is free again once the prior listener is dropped");
    let accept2 = tokio::spawn(async move { listener2.accept(SHORT).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fresh = client.connect("server", 9400, 9401, SHORT).await.expect("connect must re-dial");
    accept2.await.expect("accept task must not panic").expect("accept must succeed");
    assert_ne!(fresh.id(), first_id, "a closed connection must not be handed back by the pool");
}
