//! End-to-end forwarding over TCP loopback links: a forwarder instance
//! runs its dispatcher loop on the local set while test clients drive it
//! through plain adapters.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::LocalSet;

use ccnx_codec::{CcnxMessage, ContentObject, Interest, Name, ReturnCode};
use athena_fwd::{Athena, AthenaError, LinkVector, TransportLinkAdapter};

struct TestClient {
    adapter: TransportLinkAdapter,
    link: LinkVector,
}

impl TestClient {
    async fn connect(port: u16, name: &str) -> Self {
        let mut adapter = TransportLinkAdapter::new(Box::new(|_| {}));
        adapter
            .open(&format!("tcp://127.0.0.1:{}/name={}", port, name))
            .await
            .expect("client connect");
        let id = adapter.link_name_to_id(name).expect("client link id");
        Self { adapter, link: LinkVector::single(id) }
    }

    fn send(&mut self, message: &CcnxMessage) {
        let sent = self.adapter.send(message, &self.link.clone());
        assert_eq!(sent, self.link, "client link refused the send");
    }

    async fn recv(&mut self, timeout_ms: u64) -> CcnxMessage {
        let (message, _) = self
            .adapter
            .receive(Duration::from_millis(timeout_ms))
            .await
            .expect("client receive");
        message
    }

    async fn recv_nothing(&mut self, timeout_ms: u64) {
        match self.adapter.receive(Duration::from_millis(timeout_ms)).await {
            Err(AthenaError::WouldBlock) => {}
            Ok((message, _)) => panic!("unexpected message {:?}", message),
            Err(error) => panic!("unexpected receive error {}", error),
        }
    }

    /// Sends a control interest and returns the response payload.
    async fn control(&mut self, name: &str, payload: &str) -> String {
        let request = Interest::new(Name::from_uri(name).expect("control name"))
            .with_payload(payload.as_bytes());
        self.send(&CcnxMessage::Interest(Arc::new(request)));
        match self.recv(2000).await {
            CcnxMessage::Object(object) => String::from_utf8_lossy(&object.payload).to_string(),
            other => panic!("unexpected control response {:?}", other),
        }
    }
}

async fn start_forwarder(port: u16, store_mb: usize) {
    let mut athena = Athena::new(store_mb);
    athena
        .transport()
        .open(&format!("tcp://127.0.0.1:{}/listener/name=ingest", port))
        .await
        .expect("forwarder listener");
    tokio::task::spawn_local(async move {
        athena.run().await;
    });
}

#[tokio::test(flavor = "current_thread")]
async fn interest_content_round_trip_with_caching() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let port = 43001;
            start_forwarder(port, 1).await;

            let mut a = TestClient::connect(port, "A").await;
            let mut b = TestClient::connect(port, "B").await;

            // Route lci:/foo/bar toward B (the ingress link of the add).
            let ack = b.control("ccnx:/local/forwarder/FIB/add", "lci:/foo/bar").await;
            assert!(ack.starts_with("Route added"), "{}", ack);

            let interest = Interest::new(Name::from_uri("lci:/foo/bar/x").expect("name"))
                .with_lifetime(100);
            a.send(&CcnxMessage::Interest(Arc::new(interest.clone())));

            match b.recv(1000).await {
                CcnxMessage::Interest(received) => {
                    assert_eq!(received.name, interest.name);
                }
                other => panic!("unexpected message {:?}", other),
            }

            let object = ContentObject::new(Name::from_uri("lci:/foo/bar/x").expect("name"))
                .with_payload(b"hi");
            b.send(&CcnxMessage::Object(Arc::new(object)));

            match a.recv(1000).await {
                CcnxMessage::Object(received) => assert_eq!(received.payload, b"hi"),
                other => panic!("unexpected message {:?}", other),
            }

            // The same request again is served from the content store; B
            // sees no second interest.
            let again = Interest::new(Name::from_uri("lci:/foo/bar/x").expect("name"))
                .with_lifetime(100);
            a.send(&CcnxMessage::Interest(Arc::new(again)));
            match a.recv(1000).await {
                CcnxMessage::Object(received) => assert_eq!(received.payload, b"hi"),
                other => panic!("unexpected message {:?}", other),
            }
            b.recv_nothing(200).await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn interests_aggregate_and_fan_back_out() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let port = 43002;
            start_forwarder(port, 1).await;

            let mut a = TestClient::connect(port, "A").await;
            let mut b = TestClient::connect(port, "B").await;
            let mut c = TestClient::connect(port, "C").await;

            let ack = c.control("ccnx:/local/forwarder/FIB/add", "lci:/z").await;
            assert!(ack.starts_with("Route added"), "{}", ack);

            let interest =
                Interest::new(Name::from_uri("lci:/z").expect("name")).with_lifetime(200);
            a.send(&CcnxMessage::Interest(Arc::new(interest.clone())));
            b.send(&CcnxMessage::Interest(Arc::new(interest)));

            // Exactly one interest crosses to C; the second is aggregated.
            match c.recv(1000).await {
                CcnxMessage::Interest(received) => {
                    assert_eq!(received.name, Some(Name::from_uri("lci:/z").expect("name")));
                }
                other => panic!("unexpected message {:?}", other),
            }
            c.recv_nothing(200).await;

            let object =
                ContentObject::new(Name::from_uri("lci:/z").expect("name")).with_payload(b"zz");
            c.send(&CcnxMessage::Object(Arc::new(object)));

            for client in [&mut a, &mut b] {
                match client.recv(1000).await {
                    CcnxMessage::Object(received) => assert_eq!(received.payload, b"zz"),
                    other => panic!("unexpected message {:?}", other),
                }
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn closed_links_cascade_out_of_the_fib() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let port = 43003;
            start_forwarder(port, 1).await;

            let mut a = TestClient::connect(port, "A").await;
            let mut b = TestClient::connect(port, "B").await;
            let mut c = TestClient::connect(port, "C").await;

            a.control("ccnx:/local/forwarder/FIB/add", "lci:/a").await;
            b.control("ccnx:/local/forwarder/FIB/add", "lci:/a").await;

            let both = c.control("ccnx:/local/forwarder/FIB/lookup", "lci:/a").await;
            assert_eq!(count_links(&both), 2, "{}", both);

            // Dropping A's adapter closes its connection; the forwarder
            // purges the dead link from every table.
            drop(a);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let one = c.control("ccnx:/local/forwarder/FIB/lookup", "lci:/a").await;
            assert_eq!(count_links(&one), 1, "{}", one);

            drop(b);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let none = c.control("ccnx:/local/forwarder/FIB/lookup", "lci:/a").await;
            assert_eq!(none, "{}");

            let listing = c.control("ccnx:/local/forwarder/FIB/list", "").await;
            let parsed: serde_json::Value = serde_json::from_str(&listing).expect("json");
            assert_eq!(parsed["result"].as_array().map(Vec::len), Some(0), "{}", listing);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn unroutable_interest_bounces_back_as_no_route() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let port = 43005;
            start_forwarder(port, 1).await;

            let mut a = TestClient::connect(port, "A").await;
            let interest = Interest::new(Name::from_uri("lci:/unrouted").expect("name"))
                .with_lifetime(100);
            a.send(&CcnxMessage::Interest(Arc::new(interest.clone())));

            // The ingress link is loopback, so the forwarder answers the
            // routeless interest with an explicit return.
            match a.recv(1000).await {
                CcnxMessage::Return(ret) => {
                    assert_eq!(ret.code, ReturnCode::NoRoute);
                    assert_eq!(ret.interest.name, interest.name);
                }
                other => panic!("unexpected message {:?}", other),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn quit_stops_the_forwarder() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let port = 43004;
            start_forwarder(port, 1).await;

            let mut a = TestClient::connect(port, "A").await;
            let ack = a.control("ccnx:/local/forwarder/Control/quit", "").await;
            assert_eq!(ack, "Athena exiting");

            // Once the dispatcher loop exits nothing answers anymore.
            let request = Interest::new(
                Name::from_uri("ccnx:/local/forwarder/Control/stats").expect("name"),
            );
            a.send(&CcnxMessage::Interest(Arc::new(request)));
            a.recv_nothing(300).await;
        })
        .await;
}

/// Counts the set bits in a `{1,2,...}` vector rendering.
fn count_links(rendered: &str) -> usize {
    rendered
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter(|part| !part.is_empty())
        .count()
}
