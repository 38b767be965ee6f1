use std::sync::{Arc, Mutex};
use std::time::Duration;

use ccnx_codec::CcnxMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AthenaError, Result};
use crate::link::{
    module_for, EventReceiver, EventSender, LinkEvent, LinkRegistry, OpenContext,
};
use crate::link::uri::LinkUri;
use crate::linkset::{LinkId, LinkVector};

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Callback fired after links close so the tables drop every reference to
/// the dead ids before anything else runs.
pub type RemoveLinkCallback = Box<dyn Fn(&LinkVector)>;

#[derive(Debug, Serialize)]
pub struct LinkDescription {
    #[serde(rename = "linkName")]
    pub link_name: String,
    pub index: i64,
    #[serde(rename = "notLocal")]
    pub not_local: bool,
    #[serde(rename = "localForced")]
    pub local_forced: bool,
}

/// Single surface for sending and receiving across heterogeneous link
/// modules. Modules run as tokio tasks; everything they receive funnels
/// through one bounded channel that `receive` drains, and per-link transmit
/// queues gate send readiness.
pub struct TransportLinkAdapter {
    registry: Arc<Mutex<LinkRegistry>>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    cancel: CancellationToken,
    remove_link: RemoveLinkCallback,
    decode_errors: u64,
}

impl TransportLinkAdapter {
    pub fn new(remove_link: RemoveLinkCallback) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(LinkRegistry::new())),
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            remove_link,
            decode_errors: 0,
        }
    }

    /// Opens a listener or connection; the URI scheme selects the module.
    /// Returns the registered link name.
    pub async fn open(&mut self, uri: &str) -> Result<String> {
        let parsed = LinkUri::parse(uri)?;
        let module = module_for(&parsed.scheme)
            .ok_or_else(|| AthenaError::NotFound(format!("unknown module: {}", parsed.scheme)))?;
        let ctx = OpenContext {
            uri: parsed,
            registry: self.registry.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
        };
        let name = (module.open)(ctx).await?;
        log::info!("transport: opened link <{}>", name);
        Ok(name)
    }

    /// Closes every link named in `links`; returns the ids actually closed.
    /// The remove-link callback runs before this returns, so the tables are
    /// already purged when the caller continues.
    pub fn close(&mut self, links: &LinkVector) -> LinkVector {
        let mut removed = LinkVector::new();
        {
            let mut registry = self.registry.lock().expect("registry lock");
            for id in links.iter() {
                if let Some(link) = registry.take_routable(id) {
                    log::info!("transport: closed link <{}>", link.name);
                    link.cancel.cancel();
                    removed.set(id);
                }
            }
        }
        if !removed.is_empty() {
            (self.remove_link)(&removed);
        }
        removed
    }

    pub fn close_by_name(&mut self, name: &str) -> Result<()> {
        let routable_id = {
            let mut registry = self.registry.lock().expect("registry lock");
            match registry.id_of(name) {
                Some(id) => Some(id),
                None => match registry.take_listener(name) {
                    Some(listener) => {
                        log::info!("transport: closed listener <{}>", name);
                        listener.cancel.cancel();
                        None
                    }
                    None => return Err(AthenaError::NotFound(format!("unknown link: {}", name))),
                },
            }
        };
        if let Some(id) = routable_id {
            self.close(&LinkVector::single(id));
        }
        Ok(())
    }

    /// Hands the encoded message to every ready link in `egress`. A bit
    /// survives into the result only if the link exists, is not in error,
    /// accepted the buffer, and - for interests toward non-local links -
    /// still had hop budget. The hop limit is decremented in the wire copy
    /// before any non-local send.
    pub fn send(&mut self, message: &CcnxMessage, egress: &LinkVector) -> LinkVector {
        let wire = ccnx_codec::encode(message);
        let mut sent = LinkVector::new();
        let mut failed = Vec::new();

        {
            let registry = self.registry.lock().expect("registry lock");
            for id in egress.iter() {
                let Some(link) = registry.get(id) else {
                    continue;
                };
                if link.error {
                    continue;
                }
                let Some(tx) = &link.tx else {
                    continue;
                };

                let mut buffer = wire.clone();
                if let CcnxMessage::Interest(interest) = message {
                    if link.not_local {
                        if interest.hop_limit == 0 {
                            log::debug!(
                                "transport: dropping interest with exhausted hop limit on <{}>",
                                link.name
                            );
                            continue;
                        }
                        let _ = ccnx_codec::set_hop_limit(&mut buffer, interest.hop_limit - 1);
                    }
                }

                match tx.try_send(buffer) {
                    Ok(()) => {
                        sent.set(id);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::trace!("transport: <{}> not send-ready, dropping bit", link.name);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        failed.push(id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut registry = self.registry.lock().expect("registry lock");
            for id in failed {
                if let Some(link) = registry.get_mut(id) {
                    link.error = true;
                }
            }
        }
        sent
    }

    /// Returns the next decoded message and its single-bit ingress vector,
    /// or `WouldBlock` once `timeout` elapses with nothing deliverable.
    /// Link errors observed along the way close the offending link (and run
    /// the remove-link callback) without consuming the timeout budget of a
    /// deliverable message.
    pub async fn receive(&mut self, timeout: Duration) -> Result<(CcnxMessage, LinkVector)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Err(_) => return Err(AthenaError::WouldBlock),
                Ok(None) => return Err(AthenaError::WouldBlock),
                Ok(Some(event)) => event,
            };
            match event {
                LinkEvent::Message { link, message } => {
                    let id = self.registry.lock().expect("registry lock").id_of(&link);
                    match id {
                        Some(id) => return Ok((message, LinkVector::single(id))),
                        None => continue, // link vanished between decode and delivery
                    }
                }
                LinkEvent::DecodeError { link } => {
                    self.decode_errors += 1;
                    log::debug!("transport: decode failure on <{}>", link);
                }
                LinkEvent::Error { link } => {
                    self.handle_link_error(&link);
                }
            }
        }
    }

    pub fn link_name_to_id(&self, name: &str) -> Option<LinkId> {
        self.registry.lock().expect("registry lock").id_of(name)
    }

    pub fn link_id_to_name(&self, id: LinkId) -> Option<String> {
        self.registry.lock().expect("registry lock").name_of(id)
    }

    pub fn is_not_local(&self, id: LinkId) -> Option<bool> {
        self.registry.lock().expect("registry lock").get(id).map(|link| link.not_local)
    }

    /// Registry view for the `TransportLinkAdapter/list` control command.
    pub fn list_links(&self) -> Vec<LinkDescription> {
        let registry = self.registry.lock().expect("registry lock");
        let mut out: Vec<LinkDescription> = registry
            .routable_iter()
            .map(|(id, link)| LinkDescription {
                link_name: link.name.clone(),
                index: id as i64,
                not_local: link.not_local,
                local_forced: link.local_forced,
            })
            .collect();
        out.extend(registry.listener_iter().map(|link| LinkDescription {
            link_name: link.name.clone(),
            index: -1,
            not_local: link.not_local,
            local_forced: link.local_forced,
        }));
        out
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    fn handle_link_error(&mut self, name: &str) {
        log::warn!("transport: link <{}> errored, scheduling removal", name);
        if let Some(id) = self.link_name_to_id(name) {
            if let Some(link) = self.registry.lock().expect("registry lock").get_mut(id) {
                link.error = true;
            }
            self.close(&LinkVector::single(id));
        }
    }
}

impl Drop for TransportLinkAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
