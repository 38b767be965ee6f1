use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use ccnx_codec::{CcnxMessage, ContentObject, Interest, InterestReturn, Name, ReturnCode};
use serde::Serialize;

use crate::adapter::TransportLinkAdapter;
use crate::clock::{Clock, SystemClock};
use crate::control;
use crate::error::AthenaError;
use crate::fib::Fib;
use crate::linkset::LinkVector;
use crate::pit::{Pit, PitResolution};
use crate::store::LruContentStore;

/// Namespace intercepted by the dispatcher and routed to the control
/// handlers instead of the forwarding pipeline.
pub const FORWARDER_PREFIX: &str = "ccnx:/local/forwarder";

/// Control responses stay valid just long enough to ride the reverse path.
pub const CONTROL_RESPONSE_LIFETIME_MS: u64 = 100;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exit,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwarderStats {
    #[serde(rename = "numProcessedInterests")]
    pub interests: u64,
    #[serde(rename = "numProcessedContentObjects")]
    pub content_objects: u64,
    #[serde(rename = "numProcessedInterestReturns")]
    pub interest_returns: u64,
    #[serde(rename = "numProcessedControlMessages")]
    pub control_messages: u64,
    #[serde(rename = "numProcessedManifests")]
    pub manifests: u64,
}

/// One forwarder instance: the three tables, the link adapter, counters,
/// and run state. Everything is touched only from the dispatcher's thread;
/// the tables sit behind `Rc<RefCell>` so the adapter's remove-link
/// callback can purge them mid-close.
pub struct Athena {
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) fib: Rc<RefCell<Fib>>,
    pub(crate) pit: Rc<RefCell<Pit>>,
    pub(crate) store: Rc<RefCell<LruContentStore>>,
    pub(crate) transport: TransportLinkAdapter,
    pub(crate) stats: ForwarderStats,
    pub(crate) state: RunState,
    pub(crate) start_wall_ms: u64,
    control_prefix: Name,
}

impl Athena {
    pub fn new(content_store_mb: usize) -> Self {
        Self::with_clock(Rc::new(SystemClock::new()), content_store_mb)
    }

    pub fn with_clock(clock: Rc<dyn Clock>, content_store_mb: usize) -> Self {
        let fib = Rc::new(RefCell::new(Fib::new()));
        let pit = Rc::new(RefCell::new(Pit::new(clock.clone())));
        let store = Rc::new(RefCell::new(LruContentStore::new(clock.clone(), content_store_mb)));

        let callback_fib = fib.clone();
        let callback_pit = pit.clone();
        let transport = TransportLinkAdapter::new(Box::new(move |links| {
            callback_pit.borrow_mut().remove_link(links);
            callback_fib.borrow_mut().remove_link(links);
        }));

        let start_wall_ms = clock.wall_ms();
        Self {
            clock,
            fib,
            pit,
            store,
            transport,
            stats: ForwarderStats::default(),
            state: RunState::Running,
            start_wall_ms,
            control_prefix: Name::from_uri(FORWARDER_PREFIX).expect("static control prefix"),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    pub fn transport(&mut self) -> &mut TransportLinkAdapter {
        &mut self.transport
    }

    pub fn fib(&self) -> Rc<RefCell<Fib>> {
        self.fib.clone()
    }

    pub fn pit(&self) -> Rc<RefCell<Pit>> {
        self.pit.clone()
    }

    pub fn content_store(&self) -> Rc<RefCell<LruContentStore>> {
        self.store.clone()
    }

    /// Dispatcher loop: receive, process, repeat, until a `quit` control
    /// flips the run state.
    pub async fn run(&mut self) {
        log::info!("athena: forwarder running");
        while self.state == RunState::Running {
            match self.transport.receive(RECEIVE_TIMEOUT).await {
                Ok((message, ingress)) => self.process_message(message, &ingress).await,
                Err(AthenaError::WouldBlock) => {}
                Err(error) => log::warn!("athena: receive failed: {}", error),
            }
        }
        log::info!("athena: forwarder exiting");
    }

    pub async fn process_message(&mut self, message: CcnxMessage, ingress: &LinkVector) {
        match message {
            CcnxMessage::Interest(interest) => self.process_interest(interest, ingress).await,
            CcnxMessage::Object(object) => self.process_object(object, ingress),
            CcnxMessage::Return(ret) => self.process_return(ret, ingress),
        }
    }

    async fn process_interest(&mut self, interest: Arc<Interest>, ingress: &LinkVector) {
        self.stats.interests += 1;

        if let Some(name) = &interest.name {
            if name.starts_with(&self.control_prefix) {
                self.process_control(interest.clone(), ingress).await;
                return;
            }
        }

        let cached = self.store.borrow_mut().get_match(&interest);
        if let Some(object) = cached {
            log::debug!("athena: content store hit");
            self.transport.send(&CcnxMessage::Object(object), ingress);
            return;
        }

        match self.pit.borrow_mut().add_interest(&interest, ingress) {
            PitResolution::Forward => {}
            PitResolution::Aggregated => return,
            PitResolution::Error => {
                log::debug!("athena: pending interest table full, dropping interest");
                return;
            }
        }

        let mut egress = match &interest.name {
            Some(name) => self.fib.borrow().lookup(name),
            None => LinkVector::new(),
        };
        egress.difference(ingress);

        if egress.is_empty() {
            // NoRoute returns go only to local consumers; remote peers just
            // see the interest expire.
            let ingress_is_local = ingress
                .next_set_after(None)
                .and_then(|id| self.transport.is_not_local(id))
                .map(|not_local| !not_local)
                .unwrap_or(false);
            if ingress_is_local {
                let ret = InterestReturn::new((*interest).clone(), ReturnCode::NoRoute);
                self.transport.send(&CcnxMessage::Return(Arc::new(ret)), ingress);
            }
            return;
        }

        let sent = self.transport.send(&CcnxMessage::Interest(interest.clone()), &egress);
        self.pit.borrow_mut().set_egress(&interest, &sent);
    }

    fn process_object(&mut self, object: Arc<ContentObject>, _ingress: &LinkVector) {
        if object.manifest {
            self.stats.manifests += 1;
        } else {
            self.stats.content_objects += 1;
        }

        let hash = object.content_hash().to_vec();
        let reverse = self.pit.borrow_mut().match_object(
            object.name.as_ref(),
            object.key_id.as_deref(),
            Some(&hash),
        );
        if reverse.is_empty() {
            return;
        }

        self.transport.send(&CcnxMessage::Object(object.clone()), &reverse);
        self.store.borrow_mut().put(object);
    }

    fn process_return(&mut self, ret: Arc<InterestReturn>, ingress: &LinkVector) {
        self.stats.interest_returns += 1;
        self.pit.borrow_mut().remove_interest(&ret.interest, ingress);
    }

    /// Control interests join the PIT like any other so the response - a
    /// content object named by the request - rides the ordinary reverse
    /// path when the dispatcher re-enters itself with it.
    async fn process_control(&mut self, interest: Arc<Interest>, ingress: &LinkVector) {
        self.stats.control_messages += 1;
        let _ = self.pit.borrow_mut().add_interest(&interest, ingress);

        if let Some(response) = control::dispatch(self, &interest, ingress).await {
            let message = CcnxMessage::Object(Arc::new(response));
            Box::pin(self.process_message(message, ingress)).await;
        }
    }

    /// Builds a control response named by the request with a short expiry.
    pub(crate) fn control_response(&self, name: Name, payload: String) -> ContentObject {
        ContentObject::new(name)
            .with_payload(payload.into_bytes())
            .with_expiry(self.clock.wall_ms() + CONTROL_RESPONSE_LIFETIME_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn forwarder() -> Athena {
        Athena::with_clock(Rc::new(ManualClock::new()), 1)
    }

    fn interest(uri: &str) -> Arc<Interest> {
        Arc::new(Interest::new(Name::from_uri(uri).expect("uri")).with_lifetime(1000))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interest_with_no_route_counts_and_drops() {
        let mut athena = forwarder();
        let ingress = LinkVector::single(0);
        athena
            .process_message(CcnxMessage::Interest(interest("ccnx:/nowhere")), &ingress)
            .await;
        assert_eq!(athena.stats().interests, 1);
        // The PIT retains the entry awaiting a route or expiry.
        assert_eq!(athena.pit.borrow().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_without_pending_interest_is_not_cached() {
        let mut athena = forwarder();
        let object = Arc::new(
            ContentObject::new(Name::from_uri("ccnx:/stray").expect("uri")).with_payload(b"x"),
        );
        athena.process_message(CcnxMessage::Object(object), &LinkVector::single(0)).await;
        assert_eq!(athena.stats().content_objects, 1);
        assert!(athena.store.borrow().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manifest_objects_count_separately() {
        let mut athena = forwarder();
        let manifest = Arc::new(
            ContentObject::new(Name::from_uri("ccnx:/m").expect("uri"))
                .with_payload(b"x")
                .as_manifest(),
        );
        athena.process_message(CcnxMessage::Object(manifest), &LinkVector::single(0)).await;
        assert_eq!(athena.stats().manifests, 1);
        assert_eq!(athena.stats().content_objects, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interest_return_clears_pending_entry() {
        let mut athena = forwarder();
        let pending = interest("ccnx:/pending");
        athena
            .process_message(CcnxMessage::Interest(pending.clone()), &LinkVector::single(0))
            .await;
        assert_eq!(athena.pit.borrow().len(), 1);

        let ret = Arc::new(InterestReturn::new((*pending).clone(), ReturnCode::NoRoute));
        athena.process_message(CcnxMessage::Return(ret), &LinkVector::single(0)).await;
        assert_eq!(athena.stats().interest_returns, 1);
        assert!(athena.pit.borrow().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn quit_control_flips_run_state() {
        let mut athena = forwarder();
        let quit = Arc::new(Interest::new(
            Name::from_uri("ccnx:/local/forwarder/Control/quit").expect("uri"),
        ));
        athena.process_message(CcnxMessage::Interest(quit), &LinkVector::single(0)).await;
        assert_eq!(athena.state(), RunState::Exit);
        assert_eq!(athena.stats().control_messages, 1);
    }
}
