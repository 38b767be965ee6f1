use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::link::fragment::{create_fragmenter, Fragmenter};
use crate::link::uri::LinkUri;
use crate::link::{
    EventSender, LinkEvent, OpenContext, OpenFuture, RegisteredLink, SharedRegistry,
    DEFAULT_MTU, DEFAULT_TX_QUEUE_CAPACITY,
};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub fn open(ctx: OpenContext) -> OpenFuture {
    Box::pin(open_inner(ctx, false))
}

pub fn open6(ctx: OpenContext) -> OpenFuture {
    Box::pin(open_inner(ctx, true))
}

async fn open_inner(ctx: OpenContext, ipv6: bool) -> Result<String> {
    if ctx.uri.listener {
        open_listener(ctx, ipv6).await
    } else {
        open_connection(ctx, ipv6).await
    }
}

fn fragmenter_pair(
    uri: &LinkUri,
) -> Result<(Option<Box<dyn Fragmenter>>, Option<Box<dyn Fragmenter>>, Option<usize>)> {
    match &uri.fragmenter {
        Some(name) => {
            let mtu = uri.mtu.unwrap_or(DEFAULT_MTU);
            Ok((Some(create_fragmenter(name, mtu)?), Some(create_fragmenter(name, mtu)?), Some(mtu)))
        }
        None => Ok((None, None, uri.mtu)),
    }
}

async fn open_connection(ctx: OpenContext, ipv6: bool) -> Result<String> {
    let bind_addr = match (&ctx.uri.src, ipv6) {
        (Some(src), _) => src.clone(),
        (None, false) => "0.0.0.0:0".to_string(),
        (None, true) => "[::]:0".to_string(),
    };

    let socket = UdpSocket::bind(&bind_addr).await?;
    socket.connect(&ctx.uri.authority).await?;
    let peer = socket.peer_addr()?;
    let socket = Arc::new(socket);

    let name = ctx.uri.name.clone().unwrap_or_else(|| format!("udp_{}", peer));
    let local = ctx.uri.local.unwrap_or_else(|| peer.ip().is_loopback());
    let (split_fragmenter, receive_fragmenter, mtu) = fragmenter_pair(&ctx.uri)?;

    let (tx_send, tx_recv) = mpsc::channel(DEFAULT_TX_QUEUE_CAPACITY);
    let cancel = ctx.cancel.child_token();

    ctx.registry.lock().expect("registry lock").add_routable(RegisteredLink {
        name: name.clone(),
        not_local: !local,
        local_forced: ctx.uri.local.is_some(),
        error: false,
        tx: Some(tx_send),
        cancel: cancel.clone(),
    })?;

    log::info!("udp: connected to <{}>", peer);

    tokio::spawn(receive_task(
        socket.clone(),
        name.clone(),
        receive_fragmenter,
        ctx.events.clone(),
        cancel.clone(),
    ));
    tokio::spawn(transmit_task(socket, None, name.clone(), mtu, split_fragmenter, tx_recv, cancel));

    Ok(name)
}

async fn receive_task(
    socket: Arc<UdpSocket>,
    link: String,
    mut fragmenter: Option<Box<dyn Fragmenter>>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buffer) => {
                match result {
                    Ok(length) => {
                        let datagram = buffer[..length].to_vec();
                        let complete = match fragmenter.as_mut() {
                            Some(fragmenter) => fragmenter.receive(datagram),
                            None => Some(datagram),
                        };
                        if let Some(wire) = complete {
                            deliver(&events, &link, &wire).await;
                        }
                    }
                    Err(error) => {
                        log::warn!("udp: <{}> receive error: {}", link, error);
                        let _ = events.send(LinkEvent::Error { link }).await;
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
}

/// Writer half shared by connections (connected socket) and listener
/// children (send_to through the listener socket).
async fn transmit_task(
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    link: String,
    mtu: Option<usize>,
    fragmenter: Option<Box<dyn Fragmenter>>,
    mut tx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            wire = tx.recv() => {
                let Some(wire) = wire else { break };
                let datagrams = match &fragmenter {
                    Some(fragmenter) => fragmenter.split(wire),
                    None => {
                        if mtu.map(|mtu| wire.len() > mtu).unwrap_or(false) {
                            log::warn!(
                                "udp: <{}> message larger than mtu and no fragmenter ({} bytes)",
                                link,
                                wire.len()
                            );
                            continue;
                        }
                        vec![wire]
                    }
                };
                for datagram in datagrams {
                    let sent = match peer {
                        Some(peer) => socket.send_to(&datagram, peer).await,
                        None => socket.send(&datagram).await,
                    };
                    if let Err(error) = sent {
                        log::warn!("udp: <{}> send failed: {}", link, error);
                    }
                }
            }
        }
    }
}

async fn deliver(events: &EventSender, link: &str, wire: &[u8]) {
    match ccnx_codec::decode(wire) {
        Ok(message) => {
            let _ = events.send(LinkEvent::Message { link: link.to_string(), message }).await;
        }
        Err(error) => {
            log::warn!("udp: <{}> dropped undecodable packet: {:?}", link, error);
            let _ = events.send(LinkEvent::DecodeError { link: link.to_string() }).await;
        }
    }
}

struct ChildLink {
    name: String,
    fragmenter: Option<Box<dyn Fragmenter>>,
}

/// Listener demultiplexing: child links are created on demand keyed by the
/// packet's source address. A child borrows the listener's socket for sends
/// and owns its reassembly state; the adapter assigns its id on
/// registration.
async fn open_listener(ctx: OpenContext, _ipv6: bool) -> Result<String> {
    let socket = Arc::new(UdpSocket::bind(&ctx.uri.authority).await?);
    let local_addr = socket.local_addr()?;
    let name = ctx.uri.name.clone().unwrap_or_else(|| format!("udp_listener_{}", local_addr));

    let cancel = ctx.cancel.child_token();
    ctx.registry.lock().expect("registry lock").add_listener(RegisteredLink {
        name: name.clone(),
        not_local: false,
        local_forced: ctx.uri.local.is_some(),
        error: false,
        tx: None,
        cancel: cancel.clone(),
    })?;

    log::info!("udp: listen on <{}>", local_addr);

    let registry = ctx.registry.clone();
    let events = ctx.events.clone();
    let uri = ctx.uri.clone();
    tokio::spawn(async move {
        let mut children: HashMap<SocketAddr, ChildLink> = HashMap::new();
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buffer) => {
                    let (length, source) = match result {
                        Ok(received) => received,
                        Err(error) => {
                            log::warn!("udp: listener <{}> receive error: {}", local_addr, error);
                            continue;
                        }
                    };

                    if !children.contains_key(&source) {
                        match demux_child(&uri, source, &socket, &registry, &cancel) {
                            Ok(child) => {
                                log::info!("udp: new peer <{}> on <{}>", source, local_addr);
                                children.insert(source, child);
                            }
                            Err(error) => {
                                log::warn!("udp: couldn't register peer <{}>: {}", source, error);
                                continue;
                            }
                        }
                    }
                    let child = children.get_mut(&source).expect("registered child");

                    let datagram = buffer[..length].to_vec();
                    let complete = match child.fragmenter.as_mut() {
                        Some(fragmenter) => fragmenter.receive(datagram),
                        None => Some(datagram),
                    };
                    if let Some(wire) = complete {
                        deliver(&events, &child.name, &wire).await;
                    }
                }
            }
        }
    });

    Ok(name)
}

fn demux_child(
    uri: &LinkUri,
    source: SocketAddr,
    socket: &Arc<UdpSocket>,
    registry: &SharedRegistry,
    listener_cancel: &CancellationToken,
) -> Result<ChildLink> {
    let name = format!("udp_{}", source);
    let local = uri.local.unwrap_or_else(|| source.ip().is_loopback());
    let (split_fragmenter, receive_fragmenter, mtu) = fragmenter_pair(uri)?;

    let (tx_send, tx_recv) = mpsc::channel(DEFAULT_TX_QUEUE_CAPACITY);
    let cancel = listener_cancel.child_token();

    registry.lock().expect("registry lock").add_routable(RegisteredLink {
        name: name.clone(),
        not_local: !local,
        local_forced: uri.local.is_some(),
        error: false,
        tx: Some(tx_send),
        cancel: cancel.clone(),
    })?;

    tokio::spawn(transmit_task(
        socket.clone(),
        Some(source),
        name.clone(),
        mtu,
        split_fragmenter,
        tx_recv,
        cancel,
    ));

    Ok(ChildLink { name, fragmenter: receive_fragmenter })
}
