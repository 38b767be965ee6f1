//! Fragmented delivery over UDP link pairs and listener demultiplexing.

use std::sync::Arc;
use std::time::Duration;

use ccnx_codec::{CcnxMessage, Interest, Name};
use athena_fwd::{LinkVector, TransportLinkAdapter};

fn adapter() -> TransportLinkAdapter {
    TransportLinkAdapter::new(Box::new(|_| {}))
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_interest_reassembles_across_udp() {
    let mut receiver = adapter();
    receiver
        .open("udp://127.0.0.1:43101/listener/fragmenter=BEFS/mtu=1500")
        .await
        .expect("listener");

    let mut sender = adapter();
    sender
        .open("udp://127.0.0.1:43101/name=up/fragmenter=BEFS/mtu=1500")
        .await
        .expect("connect");

    let payload = vec![0x5a; 64000];
    let interest = Interest::new(Name::from_uri("lci:/bulk").expect("name"))
        .with_payload(payload.clone());
    let message = CcnxMessage::Interest(Arc::new(interest));
    let wire = ccnx_codec::encode(&message);

    let egress = LinkVector::single(sender.link_name_to_id("up").expect("id"));
    assert_eq!(sender.send(&message, &egress), egress);

    let (received, ingress) = receiver.receive(Duration::from_secs(3)).await.expect("receive");
    assert_eq!(ingress.count(), 1);
    match received {
        CcnxMessage::Interest(received) => {
            assert_eq!(received.payload, payload);
            // The reassembled message re-encodes to the exact wire bytes
            // that were sent.
            assert_eq!(ccnx_codec::encode(&CcnxMessage::Interest(received)), wire);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn udp_listener_demultiplexes_sources_into_child_links() {
    let mut receiver = adapter();
    receiver.open("udp://127.0.0.1:43102/listener").await.expect("listener");

    let mut first = adapter();
    first.open("udp://127.0.0.1:43102/name=one").await.expect("connect");
    let mut second = adapter();
    second.open("udp://127.0.0.1:43102/name=two").await.expect("connect");

    let probe = |uri: &str| {
        CcnxMessage::Interest(Arc::new(Interest::new(Name::from_uri(uri).expect("name"))))
    };

    let one = LinkVector::single(first.link_name_to_id("one").expect("id"));
    assert_eq!(first.send(&probe("lci:/from/one"), &one), one);
    let two = LinkVector::single(second.link_name_to_id("two").expect("id"));
    assert_eq!(second.send(&probe("lci:/from/two"), &two), two);

    let (_, ingress_one) = receiver.receive(Duration::from_secs(2)).await.expect("first");
    let (_, ingress_two) = receiver.receive(Duration::from_secs(2)).await.expect("second");

    // Each source address lands on its own routable child link.
    assert_eq!(ingress_one.count(), 1);
    assert_eq!(ingress_two.count(), 1);
    assert_ne!(ingress_one, ingress_two);
}

#[tokio::test(flavor = "current_thread")]
async fn child_links_answer_back_through_the_listener_socket() {
    let mut receiver = adapter();
    receiver.open("udp://127.0.0.1:43103/listener").await.expect("listener");

    let mut client = adapter();
    client.open("udp://127.0.0.1:43103/name=up").await.expect("connect");

    let interest =
        CcnxMessage::Interest(Arc::new(Interest::new(Name::from_uri("lci:/echo").expect("name"))));
    let up = LinkVector::single(client.link_name_to_id("up").expect("id"));
    assert_eq!(client.send(&interest, &up), up);

    let (message, ingress) = receiver.receive(Duration::from_secs(2)).await.expect("interest");
    // Replying on the child's ingress id reaches the original sender.
    assert_eq!(receiver.send(&message, &ingress), ingress);
    client.receive(Duration::from_secs(2)).await.expect("echo");
}
