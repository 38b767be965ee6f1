//! Raw Ethernet links over AF_PACKET sockets. Each packet is one frame: a
//! 14-byte header (destination MAC, source MAC, ethertype) followed by the
//! TLV packet or a fragment of it.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AthenaError, Result};
use crate::link::fragment::{create_fragmenter, Fragmenter};
use crate::link::uri::LinkUri;
use crate::link::{
    EventSender, LinkEvent, OpenContext, OpenFuture, RegisteredLink, SharedRegistry,
    DEFAULT_MTU, DEFAULT_TX_QUEUE_CAPACITY,
};

/// Default CCNx ethertype.
pub const CCNX_ETHERTYPE: u16 = 0x0801;

const HEADER_LENGTH: usize = 14;
const BROADCAST: [u8; 6] = [0xff; 6];
const FRAME_BUFFER_SIZE: usize = 9216;

pub fn open(ctx: OpenContext) -> OpenFuture {
    Box::pin(open_inner(ctx))
}

async fn open_inner(ctx: OpenContext) -> Result<String> {
    if ctx.uri.listener {
        open_listener(ctx).await
    } else {
        open_connection(ctx).await
    }
}

struct EthSocket {
    fd: AsyncFd<OwnedFd>,
    mac: [u8; 6],
    ifindex: i32,
    ethertype: u16,
}

impl EthSocket {
    fn open(interface: &str, ethertype: u16) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ethertype.to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let ifindex = interface_index(interface)?;
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ethertype.to_be();
        addr.sll_ifindex = ifindex;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mac = interface_mac(fd.as_raw_fd(), interface)?;
        Ok(Self { fd: AsyncFd::new(fd)?, mac, ifindex, ethertype })
    }

    async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let rc = unsafe {
                    libc::recv(
                        inner.get_ref().as_raw_fd(),
                        buffer.as_mut_ptr() as *mut libc::c_void,
                        buffer.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(outcome) => return outcome,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, destination: &[u8; 6], frame: &[u8]) -> io::Result<usize> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = self.ethertype.to_be();
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(destination);

        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let rc = unsafe {
                    libc::sendto(
                        inner.get_ref().as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                        0,
                        &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(outcome) => return outcome,
                Err(_would_block) => continue,
            }
        }
    }
}

fn interface_index(interface: &str) -> Result<i32> {
    let name = CString::new(interface)
        .map_err(|_| AthenaError::Invalid(format!("bad interface name: {}", interface)))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(AthenaError::NotFound(format!("no such interface: {}", interface)));
    }
    Ok(index as i32)
}

fn interface_mac(fd: i32, interface: &str) -> Result<[u8; 6]> {
    let mut request: libc::ifreq = unsafe { mem::zeroed() };
    let name = CString::new(interface)
        .map_err(|_| AthenaError::Invalid(format!("bad interface name: {}", interface)))?;
    let bytes = name.as_bytes_with_nul();
    if bytes.len() > request.ifr_name.len() {
        return Err(AthenaError::Invalid(format!("interface name too long: {}", interface)));
    }
    for (slot, &byte) in request.ifr_name.iter_mut().zip(bytes) {
        *slot = byte as libc::c_char;
    }

    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut request) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let hwaddr = unsafe { request.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (slot, &byte) in mac.iter_mut().zip(hwaddr.sa_data.iter()) {
        *slot = byte as u8;
    }
    Ok(mac)
}

pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return Err(AthenaError::Invalid(format!("bad mac address: {}", text)));
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| AthenaError::Invalid(format!("bad mac address: {}", text)))?;
    }
    Ok(mac)
}

fn format_mac(mac: &[u8; 6]) -> String {
    hex::encode(mac)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

fn build_frame(destination: &[u8; 6], source: &[u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
    frame.extend_from_slice(destination);
    frame.extend_from_slice(source);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn parse_frame(frame: &[u8]) -> Option<([u8; 6], [u8; 6], u16, &[u8])> {
    if frame.len() < HEADER_LENGTH {
        return None;
    }
    let mut destination = [0u8; 6];
    let mut source = [0u8; 6];
    destination.copy_from_slice(&frame[..6]);
    source.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Some((destination, source, ethertype, &frame[HEADER_LENGTH..]))
}

fn fragmenter_pair(
    uri: &LinkUri,
) -> Result<(Option<Box<dyn Fragmenter>>, Option<Box<dyn Fragmenter>>, usize)> {
    let mtu = uri.mtu.unwrap_or(DEFAULT_MTU);
    match &uri.fragmenter {
        Some(name) => {
            // The fragmenter budget excludes the frame header.
            let budget = mtu.saturating_sub(HEADER_LENGTH);
            if budget <= crate::link::fragment::FRAGMENT_HEADER_LENGTH {
                return Err(AthenaError::Invalid(format!("mtu too small for fragmentation: {}", mtu)));
            }
            Ok((Some(create_fragmenter(name, budget)?), Some(create_fragmenter(name, budget)?), mtu))
        }
        None => Ok((None, None, mtu)),
    }
}

/// A point-to-point link toward one remote MAC: `eth://<mac>/src=<ifname>`.
async fn open_connection(ctx: OpenContext) -> Result<String> {
    let remote = parse_mac(&ctx.uri.authority)?;
    let interface = ctx
        .uri
        .src
        .clone()
        .ok_or_else(|| AthenaError::Invalid("eth connection requires src=<interface>".into()))?;

    let socket = Arc::new(EthSocket::open(&interface, CCNX_ETHERTYPE)?);
    let name = ctx.uri.name.clone().unwrap_or_else(|| format!("eth_{}", format_mac(&remote)));
    let (split_fragmenter, receive_fragmenter, mtu) = fragmenter_pair(&ctx.uri)?;

    let (tx_send, tx_recv) = mpsc::channel(DEFAULT_TX_QUEUE_CAPACITY);
    let cancel = ctx.cancel.child_token();

    ctx.registry.lock().expect("registry lock").add_routable(RegisteredLink {
        name: name.clone(),
        not_local: !ctx.uri.local.unwrap_or(false),
        local_forced: ctx.uri.local.is_some(),
        error: false,
        tx: Some(tx_send),
        cancel: cancel.clone(),
    })?;

    log::info!("eth: <{}> via {} toward {}", name, interface, format_mac(&remote));

    {
        let socket = socket.clone();
        let events = ctx.events.clone();
        let name = name.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            connection_receive_loop(socket, remote, name, receive_fragmenter, events, cancel).await;
        });
    }
    tokio::spawn(transmit_task(socket, remote, name.clone(), mtu, split_fragmenter, tx_recv, cancel));

    Ok(name)
}

async fn connection_receive_loop(
    socket: Arc<EthSocket>,
    remote: [u8; 6],
    link: String,
    mut fragmenter: Option<Box<dyn Fragmenter>>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; FRAME_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buffer) => {
                let length = match result {
                    Ok(length) => length,
                    Err(error) => {
                        log::warn!("eth: <{}> receive error: {}", link, error);
                        let _ = events.send(LinkEvent::Error { link }).await;
                        cancel.cancel();
                        break;
                    }
                };
                let Some((destination, source, ethertype, payload)) = parse_frame(&buffer[..length])
                else {
                    continue;
                };
                if ethertype != socket.ethertype || source != remote {
                    continue;
                }
                if destination != socket.mac && destination != BROADCAST {
                    continue;
                }
                let complete = match fragmenter.as_mut() {
                    Some(fragmenter) => fragmenter.receive(payload.to_vec()),
                    None => Some(payload.to_vec()),
                };
                if let Some(wire) = complete {
                    deliver(&events, &link, &wire).await;
                }
            }
        }
    }
}

async fn transmit_task(
    socket: Arc<EthSocket>,
    remote: [u8; 6],
    link: String,
    mtu: usize,
    fragmenter: Option<Box<dyn Fragmenter>>,
    mut tx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            wire = tx.recv() => {
                let Some(wire) = wire else { break };
                let payloads = match &fragmenter {
                    Some(fragmenter) => fragmenter.split(wire),
                    None => {
                        if wire.len() + HEADER_LENGTH > mtu {
                            log::warn!(
                                "eth: <{}> message larger than mtu and no fragmenter ({} bytes)",
                                link,
                                wire.len()
                            );
                            continue;
                        }
                        vec![wire]
                    }
                };
                for payload in payloads {
                    let frame = build_frame(&remote, &socket.mac, socket.ethertype, &payload);
                    if let Err(error) = socket.send(&remote, &frame).await {
                        log::warn!("eth: <{}> send failed: {}", link, error);
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
            log::warn!("eth: <{}> dropped undecodable frame: {:?}", link, error);
            let _ = events.send(LinkEvent::DecodeError { link: link.to_string() }).await;
        }
    }
}

struct ChildLink {
    name: String,
    fragmenter: Option<Box<dyn Fragmenter>>,
}

/// Listener on an interface: `eth://<ifname>/listener`. Children are keyed
/// by source MAC and share the listener socket for sends.
async fn open_listener(ctx: OpenContext) -> Result<String> {
    let interface = ctx.uri.authority.clone();
    let socket = Arc::new(EthSocket::open(&interface, CCNX_ETHERTYPE)?);
    let name = ctx.uri.name.clone().unwrap_or_else(|| format!("eth_listener_{}", interface));

    let cancel = ctx.cancel.child_token();
    ctx.registry.lock().expect("registry lock").add_listener(RegisteredLink {
        name: name.clone(),
        not_local: false,
        local_forced: ctx.uri.local.is_some(),
        error: false,
        tx: None,
        cancel: cancel.clone(),
    })?;

    log::info!("eth: listen on <{}> ({})", interface, format_mac(&socket.mac));

    let registry = ctx.registry.clone();
    let events = ctx.events.clone();
    let uri = ctx.uri.clone();
    tokio::spawn(async move {
        let mut children: HashMap<[u8; 6], ChildLink> = HashMap::new();
        let mut buffer = vec![0u8; FRAME_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv(&mut buffer) => {
                    let length = match result {
                        Ok(length) => length,
                        Err(error) => {
                            log::warn!("eth: listener <{}> receive error: {}", interface, error);
                            continue;
                        }
                    };
                    let Some((destination, source, ethertype, payload)) =
                        parse_frame(&buffer[..length])
                    else {
                        continue;
                    };
                    if ethertype != socket.ethertype || source == socket.mac {
                        continue;
                    }
                    if destination != socket.mac && destination != BROADCAST {
                        continue;
                    }

                    if !children.contains_key(&source) {
                        match demux_child(&uri, source, &socket, &registry, &cancel) {
                            Ok(child) => {
                                log::info!(
                                    "eth: new peer <{}> on <{}>",
                                    format_mac(&source),
                                    interface
                                );
                                children.insert(source, child);
                            }
                            Err(error) => {
                                log::warn!(
                                    "eth: couldn't register peer <{}>: {}",
                                    format_mac(&source),
                                    error
                                );
                                continue;
                            }
                        }
                    }
                    let child = children.get_mut(&source).expect("registered child");

                    let complete = match child.fragmenter.as_mut() {
                        Some(fragmenter) => fragmenter.receive(payload.to_vec()),
                        None => Some(payload.to_vec()),
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
    source: [u8; 6],
    socket: &Arc<EthSocket>,
    registry: &SharedRegistry,
    listener_cancel: &CancellationToken,
) -> Result<ChildLink> {
    let name = format!("eth_{}", format_mac(&source));
    let (split_fragmenter, receive_fragmenter, mtu) = fragmenter_pair(uri)?;

    let (tx_send, tx_recv) = mpsc::channel(DEFAULT_TX_QUEUE_CAPACITY);
    let cancel = listener_cancel.child_token();

    registry.lock().expect("registry lock").add_routable(RegisteredLink {
        name: name.clone(),
        not_local: !uri.local.unwrap_or(false),
        local_forced: uri.local.is_some(),
        error: false,
        tx: Some(tx_send),
        cancel: cancel.clone(),
    })?;

    tokio::spawn(transmit_task(
        socket.clone(),
        source,
        name.clone(),
        mtu,
        split_fragmenter,
        tx_recv,
        cancel,
    ));

    Ok(ChildLink { name, fragmenter: receive_fragmenter })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_format_round_trip() {
        let mac = parse_mac("aa:bb:cc:00:11:22").expect("parse");
        assert_eq!(mac, [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        assert_eq!(format_mac(&mac), "aa:bb:cc:00:11:22");
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("zz:bb:cc:00:11:22").is_err());
    }

    #[test]
    fn frame_round_trip() {
        let destination = [1u8; 6];
        let source = [2u8; 6];
        let frame = build_frame(&destination, &source, CCNX_ETHERTYPE, b"payload");
        let (d, s, ethertype, payload) = parse_frame(&frame).expect("parse");
        assert_eq!(d, destination);
        assert_eq!(s, source);
        assert_eq!(ethertype, CCNX_ETHERTYPE);
        assert_eq!(payload, b"payload");
        assert!(parse_frame(&frame[..10]).is_none());
    }
}
