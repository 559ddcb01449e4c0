// P2P node: listener, per-connection read loops, handshake, header-first
// sync and inv/getdata gossip.
//
// Each connection runs one task that selects between its socket and the
// node-wide broadcast channel; writes happen only from that task, so
// per-connection ordering holds. Any protocol error tears down just the
// offending peer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{P2P_BIND_ADDRESS, PROTOCOL_VERSION};
use crate::consensus::engine::{BlockOutcome, RejectReason};
use crate::consensus::validate;
use crate::net::protocol::{
    FramedStream, GetDataPayload, GetHeadersPayload, HeadersPayload, InvVector, Message,
    ProtocolError, VersionPayload, INV_TYPE_BLOCK, INV_TYPE_TX,
};
use crate::node::context::{NodeContext, SubmitError};
use crate::primitives::{unix_now, BlockHeader};

const MAX_HEADERS_PER_MSG: usize = 2000;

pub enum P2pCommand {
    Connect(SocketAddr),
    Broadcast(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unconnected,
    VersionSent,
    Ready,
}

pub struct PeerInfo {
    pub state: HandshakeState,
    pub best_height: i64,
    pub is_outbound: bool,
}

pub struct P2PNode {
    ctx: Arc<NodeContext>,
    broadcast_tx: broadcast::Sender<Message>,
}

impl P2PNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        P2PNode { ctx, broadcast_tx }
    }

    pub async fn start(
        &self,
        port: u16,
        mut cmd_rx: UnboundedReceiver<P2pCommand>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = format!("{P2P_BIND_ADDRESS}:{port}").parse::<SocketAddr>()?;
        let listener = TcpListener::bind(addr).await?;
        eprintln!("[p2p] listening on {addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    self.spawn_connection(stream, peer_addr, false);
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(P2pCommand::Connect(target)) => {
                            if let Err(e) = self.connect(target).await {
                                eprintln!("[p2p] connect to {target} failed: {e}");
                            }
                        }
                        Some(P2pCommand::Broadcast(msg)) => {
                            let _ = self.broadcast_tx.send(msg);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        self.spawn_connection(stream, addr, true);
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, is_outbound: bool) {
        let ctx = self.ctx.clone();
        let broadcast_rx = self.broadcast_tx.subscribe();
        tokio::spawn(async move {
            // outcome is logged by the connection handler itself
            let _ = handle_connection(ctx, stream, addr, broadcast_rx, is_outbound).await;
        });
    }
}

async fn handle_connection(
    ctx: Arc<NodeContext>,
    stream: TcpStream,
    addr: SocketAddr,
    mut broadcast_rx: broadcast::Receiver<Message>,
    is_outbound: bool,
) -> Result<(), ProtocolError> {
    let mut s = FramedStream::new(stream);

    {
        let mut peers = ctx.peers.lock().await;
        peers.insert(
            addr,
            PeerInfo {
                state: HandshakeState::Unconnected,
                best_height: -1,
                is_outbound,
            },
        );
    }

    let result = run_peer(&ctx, &mut s, addr, &mut broadcast_rx).await;
    ctx.peers.lock().await.remove(&addr);
    match &result {
        Ok(()) => eprintln!("[p2p] {addr} disconnected"),
        Err(e) => eprintln!("[p2p] {addr} disconnected: {e}"),
    }
    result
}

async fn run_peer(
    ctx: &Arc<NodeContext>,
    s: &mut FramedStream,
    addr: SocketAddr,
    broadcast_rx: &mut broadcast::Receiver<Message>,
) -> Result<(), ProtocolError> {
    s.send(&Message::Version(VersionPayload {
        protocol_version: PROTOCOL_VERSION,
        services: 1,
        timestamp: unix_now(),
        best_height: ctx.height().await,
    }))
    .await?;
    if let Some(info) = ctx.peers.lock().await.get_mut(&addr) {
        info.state = HandshakeState::VersionSent;
    }

    loop {
        tokio::select! {
            incoming = s.recv() => {
                let Some(msg) = incoming? else { return Ok(()) };
                let ready = ctx
                    .peers
                    .lock()
                    .await
                    .get(&addr)
                    .map(|p| p.state == HandshakeState::Ready)
                    .unwrap_or(false);
                match (msg, ready) {
                    (Message::Version(v), false) => handle_version(ctx, s, addr, v).await?,
                    (Message::Version(_), true) => {
                        return Err(ProtocolError::Violation("repeated version".into()));
                    }
                    (m, true) => handle_msg(ctx, s, addr, m).await?,
                    (_, false) => {
                        return Err(ProtocolError::Violation("message before handshake".into()));
                    }
                }
            }
            outgoing = broadcast_rx.recv() => {
                if let Ok(m) = outgoing {
                    s.send(&m).await?;
                }
            }
        }
    }
}

async fn handle_version(
    ctx: &Arc<NodeContext>,
    s: &mut FramedStream,
    addr: SocketAddr,
    v: VersionPayload,
) -> Result<(), ProtocolError> {
    {
        let mut peers = ctx.peers.lock().await;
        if let Some(info) = peers.get_mut(&addr) {
            info.best_height = v.best_height;
            info.state = HandshakeState::Ready;
        }
    }
    eprintln!("[p2p] {addr} ready (peer height {})", v.best_height);

    // header-first sync: whoever is behind asks for headers
    if v.best_height > ctx.height().await {
        send_get_headers(ctx, s).await?;
    }
    Ok(())
}

async fn send_get_headers(ctx: &Arc<NodeContext>, s: &mut FramedStream) -> Result<(), ProtocolError> {
    let locator = ctx.chain.lock().await.locator();
    s.send(&Message::GetHeaders(GetHeadersPayload {
        protocol_version: PROTOCOL_VERSION,
        locator_hashes: locator,
        hash_stop: "0".repeat(64),
    }))
    .await
}

async fn handle_msg(
    ctx: &Arc<NodeContext>,
    s: &mut FramedStream,
    addr: SocketAddr,
    msg: Message,
) -> Result<(), ProtocolError> {
    match msg {
        // version is handled before dispatch; nothing to do here
        Message::Version(_) => {}

        Message::GetHeaders(p) => {
            let headers = {
                let chain = ctx.chain.lock().await;
                let after = p.locator_hashes.first().map(String::as_str).unwrap_or("");
                chain.headers_after(after, MAX_HEADERS_PER_MSG)
            };
            if !headers.is_empty() {
                s.send(&Message::Headers(HeadersPayload { headers })).await?;
            }
        }

        Message::Headers(p) => handle_headers(ctx, s, addr, p.headers).await?,

        Message::Inv(p) => {
            let mut wanted: Vec<InvVector> = Vec::new();
            {
                let chain = ctx.chain.lock().await;
                for item in p.inventory.iter().filter(|i| i.kind == INV_TYPE_BLOCK) {
                    if !chain.have_block(&item.hash) {
                        wanted.push(item.clone());
                    }
                }
            }
            {
                let pool = ctx.mempool.lock().await;
                for item in p.inventory.iter().filter(|i| i.kind == INV_TYPE_TX) {
                    if !pool.contains(&item.hash) {
                        wanted.push(item.clone());
                    }
                }
            }
            if !wanted.is_empty() {
                s.send(&Message::GetData(GetDataPayload { inventory: wanted })).await?;
            }
        }

        Message::GetData(p) => {
            for item in p.inventory {
                if item.kind == INV_TYPE_BLOCK {
                    let block = ctx.chain.lock().await.block_by_hash(&item.hash).cloned();
                    if let Some(b) = block {
                        s.send(&Message::Block(crate::net::protocol::BlockPayload {
                            block_data: b,
                        }))
                        .await?;
                    }
                } else if item.kind == INV_TYPE_TX {
                    let tx = ctx.mempool.lock().await.get(&item.hash);
                    if let Some(t) = tx {
                        s.send(&Message::Tx(crate::net::protocol::TxPayload { tx_data: t }))
                            .await?;
                    }
                }
            }
        }

        Message::Block(p) => {
            let index = p.block_data.index;
            let res = ctx.accept_block(p.block_data).await;
            match res.outcome {
                BlockOutcome::Accepted => {
                    eprintln!("[p2p] {addr} delivered block {index}, height now {}", ctx.height().await);
                }
                BlockOutcome::Pending => {
                    // parent unknown; ask the peer to fill in the gap
                    eprintln!("[p2p] {addr} delivered orphan block {index}, requesting headers");
                    send_get_headers(ctx, s).await?;
                }
                BlockOutcome::Rejected(RejectReason::DuplicateBlock)
                | BlockOutcome::Rejected(RejectReason::StaleFork) => {}
                BlockOutcome::Rejected(reason) => {
                    eprintln!("[p2p] {addr} delivered bad block {index}: {reason}");
                }
            }
        }

        Message::Tx(p) => {
            let hash = p.tx_data.tx_hash.clone();
            match ctx.accept_transaction(p.tx_data).await {
                Ok(()) => {}
                Err(SubmitError::DuplicateTransaction) => {}
                Err(e) => eprintln!("[p2p] {addr} delivered bad tx {}: {e}", &hash[..12.min(hash.len())]),
            }
        }
    }
    Ok(())
}

async fn handle_headers(
    ctx: &Arc<NodeContext>,
    s: &mut FramedStream,
    addr: SocketAddr,
    headers: Vec<BlockHeader>,
) -> Result<(), ProtocolError> {
    if headers.is_empty() {
        return Ok(());
    }

    let verified = {
        let chain = ctx.chain.lock().await;
        match &headers[0].previous_hash {
            // a run starting at genesis anchors on nothing
            None => {
                headers[0].index == 0
                    && crate::consensus::difficulty::hash_meets_target(&headers[0].hash, &headers[0].bits)
                    && headers[0].recompute_hash() == headers[0].hash
                    && validate::verify_header_chain(&headers[1..], &headers[0].hash, headers[0].timestamp)
                        .is_ok()
            }
            Some(prev) => match chain.block_by_hash(prev) {
                Some(anchor) => {
                    validate::verify_header_chain(&headers, &anchor.hash, anchor.timestamp).is_ok()
                }
                None => {
                    eprintln!("[p2p] {addr} sent headers with unknown anchor");
                    return Ok(());
                }
            },
        }
    };
    if !verified {
        eprintln!("[p2p] {addr} sent an invalid header chain");
        return Ok(());
    }

    let wanted: Vec<InvVector> = {
        let chain = ctx.chain.lock().await;
        headers
            .iter()
            .filter(|h| !chain.have_block(&h.hash))
            .map(|h| InvVector {
                kind: INV_TYPE_BLOCK,
                hash: h.hash.clone(),
            })
            .collect()
    };
    if !wanted.is_empty() {
        eprintln!("[p2p] {addr} announced {} new header(s), requesting bodies", wanted.len());
        s.send(&Message::GetData(GetDataPayload { inventory: wanted })).await?;
    }
    Ok(())
}
