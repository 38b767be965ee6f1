use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AthenaError, Result};
use crate::link::{
    EventSender, LinkEvent, OpenContext, OpenFuture, RegisteredLink, SharedRegistry,
    DEFAULT_TX_QUEUE_CAPACITY,
};

pub fn open(ctx: OpenContext) -> OpenFuture {
    Box::pin(open_inner(ctx))
}

async fn open_inner(ctx: OpenContext) -> Result<String> {
    if ctx.uri.fragmenter.is_some() {
        return Err(AthenaError::Invalid("tcp links are stream framed and do not fragment".into()));
    }
    if ctx.uri.listener {
        open_listener(ctx).await
    } else {
        open_connection(ctx).await
    }
}

async fn open_listener(ctx: OpenContext) -> Result<String> {
    let listener = TcpListener::bind(&ctx.uri.authority).await?;
    let local_addr = listener.local_addr()?;
    let name = ctx.uri.name.clone().unwrap_or_else(|| format!("tcp_listener_{}", local_addr));

    let cancel = ctx.cancel.child_token();
    ctx.registry.lock().expect("registry lock").add_listener(RegisteredLink {
        name: name.clone(),
        not_local: false,
        local_forced: ctx.uri.local.is_some(),
        error: false,
        tx: None,
        cancel: cancel.clone(),
    })?;

    log::info!("tcp: listen on <{}>", local_addr);

    let registry = ctx.registry.clone();
    let events = ctx.events.clone();
    let forced_local = ctx.uri.local;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("tcp: new client <{}> on <{}>", peer, local_addr);
                            let spawned = register_connection(
                                stream,
                                peer,
                                None,
                                forced_local,
                                &registry,
                                &events,
                                &cancel,
                            );
                            if let Err(error) = spawned {
                                log::warn!("tcp: couldn't register client <{}>: {}", peer, error);
                            }
                        }
                        Err(error) => {
                            log::warn!("tcp: accept failed on <{}>: {}", local_addr, error);
                        }
                    }
                }
            }
        }
    });

    Ok(name)
}

async fn open_connection(ctx: OpenContext) -> Result<String> {
    let peer = resolve(&ctx.uri.authority).await?;

    let stream = match &ctx.uri.src {
        Some(src) => {
            let socket = if peer.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
            socket.bind(resolve(src).await?)?;
            socket.connect(peer).await?
        }
        None => TcpStream::connect(peer).await?,
    };

    log::info!("tcp: connected to <{}>", peer);
    register_connection(
        stream,
        peer,
        ctx.uri.name.clone(),
        ctx.uri.local,
        &ctx.registry,
        &ctx.events,
        &ctx.cancel,
    )
}

/// Registers a routable stream link and spawns its reader and writer tasks.
/// Used for both outbound connections and listener-accepted children.
fn register_connection(
    stream: TcpStream,
    peer: SocketAddr,
    name: Option<String>,
    forced_local: Option<bool>,
    registry: &SharedRegistry,
    events: &EventSender,
    parent_cancel: &CancellationToken,
) -> Result<String> {
    let name = name.unwrap_or_else(|| format!("tcp_{}", peer));
    let local = forced_local.unwrap_or_else(|| peer.ip().is_loopback());

    let (tx_send, tx_recv) = mpsc::channel(DEFAULT_TX_QUEUE_CAPACITY);
    let cancel = parent_cancel.child_token();

    registry.lock().expect("registry lock").add_routable(RegisteredLink {
        name: name.clone(),
        not_local: !local,
        local_forced: forced_local.is_some(),
        error: false,
        tx: Some(tx_send),
        cancel: cancel.clone(),
    })?;

    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(receive_task(read_half, name.clone(), events.clone(), cancel.clone()));
    tokio::spawn(transmit_task(write_half, name.clone(), tx_recv, events.clone(), cancel));

    Ok(name)
}

/// Stream framing comes from the TLV header itself: read the fixed header,
/// extract the declared length, then read the remainder. A length shorter
/// than the header flushes the socket to resync.
async fn receive_task(
    mut stream: OwnedReadHalf,
    link: String,
    events: EventSender,
    cancel: CancellationToken,
) {
    let header_length = ccnx_codec::min_header_length();
    loop {
        let mut buffer = vec![0u8; header_length];
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = stream.read_exact(&mut buffer) => {
                if result.is_err() {
                    log::info!("tcp: <{}> closed", link);
                    let _ = events.send(LinkEvent::Error { link }).await;
                    cancel.cancel();
                    break;
                }
            }
        }

        match ccnx_codec::packet_length(&buffer) {
            Ok(total) => {
                buffer.resize(total, 0);
                if stream.read_exact(&mut buffer[header_length..]).await.is_err() {
                    let _ = events.send(LinkEvent::Error { link }).await;
                    cancel.cancel();
                    break;
                }
                match ccnx_codec::decode(&buffer) {
                    Ok(message) => {
                        if events.send(LinkEvent::Message { link: link.clone(), message }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        log::warn!("tcp: <{}> dropped undecodable packet: {:?}", link, error);
                        let _ = events.send(LinkEvent::DecodeError { link: link.clone() }).await;
                    }
                }
            }
            Err(error) => {
                log::warn!("tcp: <{}> framing error ({:?}), flushing stream", link, error);
                let mut discard = [0u8; 64 * 1024];
                let _ = stream.read(&mut discard).await;
            }
        }
    }
}

async fn transmit_task(
    mut stream: OwnedWriteHalf,
    link: String,
    mut tx: mpsc::Receiver<Vec<u8>>,
    events: EventSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            wire = tx.recv() => {
                let Some(wire) = wire else { break };
                if let Err(error) = stream.write_all(&wire).await {
                    log::warn!("tcp: <{}> send failed: {}", link, error);
                    let _ = events.send(LinkEvent::Error { link }).await;
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn resolve(authority: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(authority)
        .await?
        .next()
        .ok_or_else(|| AthenaError::NotFound(format!("no address for {}", authority)))
}
