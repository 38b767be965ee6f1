pub mod eth;
pub mod fragment;
pub mod tcp;
pub mod udp;
pub mod uri;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ccnx_codec::CcnxMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AthenaError, Result};
use crate::linkset::LinkId;

pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_MTU: usize = 1500;

/// Event delivered from a link task into the adapter's receive channel.
/// Every message crossing into the dispatcher is serialized through this
/// channel, whatever helpers a module runs internally.
#[derive(Debug)]
pub enum LinkEvent {
    Message { link: String, message: CcnxMessage },
    DecodeError { link: String },
    Error { link: String },
}

pub type EventSender = mpsc::Sender<LinkEvent>;
pub type EventReceiver = mpsc::Receiver<LinkEvent>;

/// A link as the adapter's registry sees it: the transmit queue feeding the
/// module's writer task plus identity flags. Listeners carry no queue.
pub struct RegisteredLink {
    pub name: String,
    pub not_local: bool,
    pub local_forced: bool,
    pub error: bool,
    pub tx: Option<mpsc::Sender<Vec<u8>>>,
    pub cancel: CancellationToken,
}

/// Routable links occupy id-indexed slots (lowest free slot wins, slots are
/// reused after close); listeners are kept aside and consume no ids.
#[derive(Default)]
pub struct LinkRegistry {
    routable: Vec<Option<RegisteredLink>>,
    listeners: Vec<RegisteredLink>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.routable.iter().flatten().any(|link| link.name == name)
            || self.listeners.iter().any(|link| link.name == name)
    }

    /// Registers a routable link under the lowest free id.
    pub fn add_routable(&mut self, link: RegisteredLink) -> Result<LinkId> {
        if self.contains_name(&link.name) {
            return Err(AthenaError::AlreadyExists(link.name.clone()));
        }
        match self.routable.iter().position(|slot| slot.is_none()) {
            Some(id) => {
                self.routable[id] = Some(link);
                Ok(id)
            }
            None => {
                self.routable.push(Some(link));
                Ok(self.routable.len() - 1)
            }
        }
    }

    pub fn add_listener(&mut self, link: RegisteredLink) -> Result<()> {
        if self.contains_name(&link.name) {
            return Err(AthenaError::AlreadyExists(link.name.clone()));
        }
        self.listeners.push(link);
        Ok(())
    }

    pub fn get(&self, id: LinkId) -> Option<&RegisteredLink> {
        self.routable.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut RegisteredLink> {
        self.routable.get_mut(id).and_then(|slot| slot.as_mut())
    }

    pub fn id_of(&self, name: &str) -> Option<LinkId> {
        self.routable
            .iter()
            .position(|slot| slot.as_ref().map(|link| link.name == name).unwrap_or(false))
    }

    pub fn name_of(&self, id: LinkId) -> Option<String> {
        self.get(id).map(|link| link.name.clone())
    }

    pub fn take_routable(&mut self, id: LinkId) -> Option<RegisteredLink> {
        self.routable.get_mut(id).and_then(|slot| slot.take())
    }

    pub fn take_listener(&mut self, name: &str) -> Option<RegisteredLink> {
        let index = self.listeners.iter().position(|link| link.name == name)?;
        Some(self.listeners.remove(index))
    }

    pub fn routable_iter(&self) -> impl Iterator<Item = (LinkId, &RegisteredLink)> {
        self.routable.iter().enumerate().filter_map(|(id, slot)| slot.as_ref().map(|l| (id, l)))
    }

    pub fn listener_iter(&self) -> impl Iterator<Item = &RegisteredLink> {
        self.listeners.iter()
    }
}

pub type SharedRegistry = Arc<Mutex<LinkRegistry>>;

/// Everything a module factory needs to open links and report traffic.
pub struct OpenContext {
    pub uri: uri::LinkUri,
    pub registry: SharedRegistry,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

pub type OpenFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Entry in the static module registry; `dlopen` by scheme in the source
/// becomes a table of factory functions here.
pub struct LinkModule {
    pub scheme: &'static str,
    pub open: fn(OpenContext) -> OpenFuture,
}

static MODULES: [LinkModule; 4] = [
    LinkModule { scheme: "tcp", open: tcp::open },
    LinkModule { scheme: "udp", open: udp::open },
    LinkModule { scheme: "udp6", open: udp::open6 },
    LinkModule { scheme: "eth", open: eth::open },
];

pub fn module_for(scheme: &str) -> Option<&'static LinkModule> {
    MODULES.iter().find(|module| module.scheme.eq_ignore_ascii_case(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str) -> RegisteredLink {
        RegisteredLink {
            name: name.to_string(),
            not_local: true,
            local_forced: false,
            error: false,
            tx: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn ids_are_reused_lowest_first() {
        let mut registry = LinkRegistry::new();
        assert_eq!(registry.add_routable(link("a")).expect("add"), 0);
        assert_eq!(registry.add_routable(link("b")).expect("add"), 1);
        assert_eq!(registry.add_routable(link("c")).expect("add"), 2);

        registry.take_routable(1);
        assert_eq!(registry.add_routable(link("d")).expect("add"), 1);
        assert_eq!(registry.add_routable(link("e")).expect("add"), 3);
    }

    #[test]
    fn duplicate_names_fail() {
        let mut registry = LinkRegistry::new();
        registry.add_routable(link("a")).expect("add");
        assert!(matches!(registry.add_routable(link("a")), Err(AthenaError::AlreadyExists(_))));
        registry.add_listener(link("l")).expect("add");
        assert!(matches!(registry.add_listener(link("l")), Err(AthenaError::AlreadyExists(_))));
        assert!(matches!(registry.add_routable(link("l")), Err(AthenaError::AlreadyExists(_))));
    }

    #[test]
    fn listeners_consume_no_ids() {
        let mut registry = LinkRegistry::new();
        registry.add_listener(link("l")).expect("add");
        assert_eq!(registry.add_routable(link("a")).expect("add"), 0);
        assert_eq!(registry.id_of("l"), None);
        assert_eq!(registry.id_of("a"), Some(0));
    }

    #[test]
    fn known_schemes_resolve() {
        for scheme in ["tcp", "udp", "udp6", "eth", "TCP"] {
            assert!(module_for(scheme).is_some(), "scheme {}", scheme);
        }
        assert!(module_for("ipc").is_none());
    }
}
