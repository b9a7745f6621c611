//! Broker-to-broker networking: wire payloads, message framing, and the
//! per-session state machine.
//!
//! A session moves `HandShaking -> Exchanging -> Closed`. During the
//! handshake only `Hello` is legal; anything else flags the peer as
//! spamming and closes. In `Exchanging` two conversations interleave: the
//! sync protocol (intra-clique one-shot inventories, inter-clique
//! locator/inventory round-trips followed by pulls) and the ping/pong
//! keepalive. A ping left unanswered by the next ping tick closes the
//! session; a pong with the wrong nonce is reported.

pub mod misbehavior;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::config::{BrokerConfig, NodeConfig};
use crate::core::params::TESTNET_MAGIC;
use crate::core::types::*;
use crate::flow::{BlockFlow, FlowError};
use crate::mempool::MemPool;
use crate::state::WorldState;
use crate::storage::Stores;
use misbehavior::{MisbehaviorConfig, MisbehaviorStorage, Offense};

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

// ─── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Hello { clique_id: Hash256, broker: BrokerConfig },
    Ping { nonce: u64, timestamp_ms: u64 },
    Pong { nonce: u64 },
    /// Per-chain locators of the requesting broker
    SyncRequest { locators: Vec<Vec<Hash256>> },
    /// Per-chain hashes extending past the requester's locators
    SyncResponse { inventories: Vec<Vec<Hash256>> },
    GetBlocks(Vec<Hash256>),
    SendBlocks(Vec<Block>),
    NewBlock(Block),
    NewTransactions(Vec<Transaction>),
}

// ─── Wire Framing ────────────────────────────────────────────────────

const HEADER_SIZE: usize = 8;
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    let body = bincode::serialize(payload).expect("payload serialization failed");
    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.extend_from_slice(&TESTNET_MAGIC);
    data.extend_from_slice(&(body.len() as u32).to_le_bytes());
    data.extend_from_slice(&body);
    data
}

async fn read_payload(stream: &mut TcpStream) -> Result<Payload, String> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.map_err(|e| format!("read header: {}", e))?;
    if header[0..4] != TESTNET_MAGIC {
        return Err("invalid magic bytes".into());
    }
    let length = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(format!("message too large: {} bytes", length));
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.map_err(|e| format!("read body: {}", e))?;
    bincode::deserialize(&body).map_err(|e| format!("deserialize: {}", e))
}

async fn write_payload(stream: &mut TcpStream, payload: &Payload) -> Result<(), String> {
    let data = encode_payload(payload);
    stream.write_all(&data).await.map_err(|e| format!("write: {}", e))?;
    stream.flush().await.map_err(|e| format!("flush: {}", e))?;
    Ok(())
}

// ─── Session State Machine ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    HandShaking,
    Exchanging,
    Closed,
}

/// Protocol state of one peer session, independent of the socket so the
/// transitions are testable in isolation.
pub struct BrokerHandler {
    pub peer_addr: String,
    state: BrokerState,
    remote_clique: Option<Hash256>,
    remote_broker: Option<BrokerConfig>,
    pending_ping: Option<u64>,
}

impl BrokerHandler {
    pub fn new(peer_addr: String) -> Self {
        BrokerHandler {
            peer_addr,
            state: BrokerState::HandShaking,
            remote_clique: None,
            remote_broker: None,
            pending_ping: None,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == BrokerState::Closed
    }

    pub fn close(&mut self) {
        self.state = BrokerState::Closed;
    }

    pub fn remote_broker(&self) -> Option<&BrokerConfig> {
        self.remote_broker.as_ref()
    }

    pub fn is_intra_clique(&self, our_clique: &Hash256) -> bool {
        self.remote_clique.as_ref() == Some(our_clique)
    }

    /// Hello is legal exactly once, as the first inbound payload
    pub fn on_hello(&mut self, clique_id: Hash256, broker: BrokerConfig) -> Result<(), Offense> {
        match self.state {
            BrokerState::HandShaking => {
                self.remote_clique = Some(clique_id);
                self.remote_broker = Some(broker);
                self.state = BrokerState::Exchanging;
                Ok(())
            }
            _ => {
                self.close();
                Err(Offense::Spamming)
            }
        }
    }

    /// Any non-Hello payload while still hand-shaking
    pub fn on_unexpected_payload(&mut self) -> Offense {
        self.close();
        Offense::Spamming
    }

    pub fn on_handshake_timeout(&mut self) -> Offense {
        self.close();
        Offense::RequestTimeout
    }

    /// Each ping tick either emits a fresh nonce or fails the session
    /// because the previous ping is still outstanding
    pub fn on_ping_tick(&mut self, nonce: u64) -> Result<u64, Offense> {
        if self.pending_ping.is_some() {
            self.close();
            return Err(Offense::RequestTimeout);
        }
        debug_assert!(nonce != 0);
        self.pending_ping = Some(nonce);
        Ok(nonce)
    }

    pub fn on_pong(&mut self, nonce: u64) -> Result<(), Offense> {
        match self.pending_ping.take() {
            Some(expected) if expected == nonce => Ok(()),
            _ => {
                self.close();
                Err(Offense::InvalidPingPong)
            }
        }
    }
}

// ─── Shared Node State ──────────────────────────────────────────────

/// Outcome of handing a network block to the flow
#[derive(Debug)]
pub enum BlockOutcome {
    Accepted(Hash256),
    /// Prerequisite to download before retrying
    Missing(Hash256),
    /// Already known; nothing to do
    Ignored,
    /// Validation failure; the supplying peer is penalized
    Rejected(FlowError),
}

pub struct NodeState {
    pub flow: Arc<BlockFlow>,
    /// One mempool per owned group, indexed by group
    mempools: Vec<Option<Arc<MemPool>>>,
    pub misbehavior: Mutex<MisbehaviorStorage>,
    pub config: NodeConfig,
    pub clique_id: Hash256,
    /// Fan-out of freshly accepted blocks (template refresh, gossip)
    pub block_tx: broadcast::Sender<Block>,
}

impl NodeState {
    pub fn new(config: NodeConfig, stores: Arc<Stores>) -> Result<Arc<Self>, FlowError> {
        let flow = Arc::new(BlockFlow::new(
            config.consensus.clone(),
            config.broker,
            stores,
        )?);
        let mut mempools = vec![None; config.broker.groups as usize];
        for group in config.broker.owned_groups() {
            mempools[group as usize] = Some(Arc::new(MemPool::new(group, config.mempool)));
        }
        let (block_tx, _) = broadcast::channel(256);
        let misbehavior = MisbehaviorStorage::new(MisbehaviorConfig {
            ban_threshold: config.network.penalty_ban_threshold,
            ban_duration_ms: config.network.ban_duration_ms,
            penalty_forgiveness_ms: config.network.penalty_forgiveness_ms,
            penalty_frequency_ms: config.network.penalty_frequency_ms,
        });
        // The clique id is shared by all brokers of one clique; a solo
        // deployment derives it from its genesis configuration
        let clique_id = crate::crypto::double_sha256(
            &bincode::serialize(&(config.broker.groups, config.broker.broker_num)).unwrap(),
        );
        Ok(Arc::new(NodeState {
            flow,
            mempools,
            misbehavior: Mutex::new(misbehavior),
            config,
            clique_id,
            block_tx,
        }))
    }

    pub fn mempool_for(&self, group: GroupIndex) -> Option<&Arc<MemPool>> {
        self.mempools.get(group as usize).and_then(|m| m.as_ref())
    }

    /// Ingest a block that arrived from the network. Accepted blocks drop
    /// their confirmed txs from the owning group's mempool and fan out.
    pub fn handle_block(&self, block: &Block) -> BlockOutcome {
        let groups = self.config.broker.groups;
        match self.flow.add_block(block) {
            Ok(hash) => {
                let chain = block.header.chain_index(groups);
                if let Some(mempool) = self.mempool_for(chain.from) {
                    mempool.remove_confirmed(block);
                }
                let _ = self.block_tx.send(block.clone());
                tracing::info!(
                    "✅ Accepted block {} on chain {}",
                    hex::encode(&hash[..8]),
                    chain,
                );
                BlockOutcome::Accepted(hash)
            }
            Err(FlowError::DuplicateBlock) => BlockOutcome::Ignored,
            Err(FlowError::MissingBlock(h)) => BlockOutcome::Missing(h),
            Err(e) => BlockOutcome::Rejected(e),
        }
    }

    /// Ingest gossiped transactions; the double-spend filter runs before
    /// any validation cost
    pub fn handle_transactions(&self, txs: &[Transaction], now_ms: u64) -> usize {
        let groups = self.config.broker.groups;
        let mut accepted = 0;
        for tx in txs {
            let group = ChainIndex::from_hash(&tx.hash(), groups).from;
            let Some(mempool) = self.mempool_for(group) else { continue };
            if mempool.is_double_spending(tx) {
                continue;
            }
            let world = self.world_for_group(group);
            if mempool.add(tx, now_ms, &world) {
                accepted += 1;
            }
        }
        accepted
    }

    /// The persisted world state readiness checks run against: the state
    /// at the best tip of the group's intra-group chain
    pub fn world_for_group(&self, group: GroupIndex) -> WorldState {
        let ci = ChainIndex::new(group, group);
        let tip = self.flow.best_tip(ci);
        self.flow
            .multi_chain()
            .read(ci, |c| c.world_state_at(&tip))
            .unwrap_or_else(|_| WorldState::new())
    }
}

// ─── Session Driver ─────────────────────────────────────────────────

pub async fn start_listener(state: Arc<NodeState>) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.network.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🔗 Broker listening on {}", addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_session(stream, state, peer.to_string()).await;
                });
            }
            Err(e) => tracing::error!("Accept error: {}", e),
        }
    }
}

pub async fn connect_to_peer(state: Arc<NodeState>, addr: String) {
    match TcpStream::connect(&addr).await {
        Ok(stream) => handle_session(stream, state, addr).await,
        Err(e) => tracing::warn!("Connect to {} failed: {}", addr, e),
    }
}

async fn handle_session(mut stream: TcpStream, state: Arc<NodeState>, peer_addr: String) {
    if state.misbehavior.lock().unwrap().is_banned(&peer_addr, now_ms()) {
        tracing::debug!("🚫 Rejected banned peer {}", peer_addr);
        return;
    }
    let _ = stream.set_nodelay(true);

    let mut handler = BrokerHandler::new(peer_addr.clone());
    let hello = Payload::Hello { clique_id: state.clique_id, broker: state.config.broker };
    if write_payload(&mut stream, &hello).await.is_err() {
        return;
    }

    // ── HandShaking ──
    let handshake = std::time::Duration::from_millis(state.config.network.handshake_timeout_ms);
    match tokio::time::timeout(handshake, read_payload(&mut stream)).await {
        Ok(Ok(Payload::Hello { clique_id, broker })) => {
            if let Err(offense) = handler.on_hello(clique_id, broker) {
                state.misbehavior.lock().unwrap().report(&peer_addr, offense, now_ms());
                return;
            }
            tracing::info!("🤝 Handshake with {} (broker {}/{})", peer_addr, broker.broker_id, broker.broker_num);
        }
        Ok(Ok(_)) => {
            let offense = handler.on_unexpected_payload();
            state.misbehavior.lock().unwrap().report(&peer_addr, offense, now_ms());
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!("Handshake read from {} failed: {}", peer_addr, e);
            return;
        }
        Err(_) => {
            let offense = handler.on_handshake_timeout();
            state.misbehavior.lock().unwrap().report(&peer_addr, offense, now_ms());
            return;
        }
    }

    // ── Exchanging: kick off sync ──
    let kickoff = if handler.is_intra_clique(&state.clique_id) {
        // Intra-clique peers get the one-shot inventory dump
        let remote = handler.remote_broker().copied().unwrap();
        Payload::SyncResponse { inventories: state.flow.get_intra_clique_sync_hashes(&remote) }
    } else {
        Payload::SyncRequest { locators: state.flow.get_sync_locators() }
    };
    if write_payload(&mut stream, &kickoff).await.is_err() {
        return;
    }

    let mut block_rx = state.block_tx.subscribe();
    let mut ping_interval = tokio::time::interval(std::time::Duration::from_millis(
        state.config.network.ping_frequency_ms,
    ));
    ping_interval.tick().await; // consume the immediate first tick

    while !handler.is_closed() {
        tokio::select! {
            _ = ping_interval.tick() => {
                let nonce = rand::random::<u64>() | 1;
                match handler.on_ping_tick(nonce) {
                    Ok(nonce) => {
                        let ping = Payload::Ping { nonce, timestamp_ms: now_ms() };
                        if write_payload(&mut stream, &ping).await.is_err() {
                            break;
                        }
                    }
                    Err(offense) => {
                        state.misbehavior.lock().unwrap().report(&peer_addr, offense, now_ms());
                        break;
                    }
                }
            }

            block = block_rx.recv() => {
                if let Ok(block) = block {
                    let _ = write_payload(&mut stream, &Payload::NewBlock(block)).await;
                }
            }

            result = read_payload(&mut stream) => {
                match result {
                    Ok(payload) => {
                        if !process_payload(&mut stream, &mut handler, &state, payload).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Peer {} read error: {}", peer_addr, e);
                        break;
                    }
                }
            }
        }
    }
    handler.close();
    tracing::info!("👋 Session with {} closed", peer_addr);
}

/// Handle one payload in the `Exchanging` state. Returns false when the
/// session should end.
async fn process_payload(
    stream: &mut TcpStream,
    handler: &mut BrokerHandler,
    state: &Arc<NodeState>,
    payload: Payload,
) -> bool {
    let peer = handler.peer_addr.clone();
    match payload {
        Payload::Hello { .. } => {
            let offense = handler.on_unexpected_payload();
            state.misbehavior.lock().unwrap().report(&peer, offense, now_ms());
            false
        }
        Payload::Ping { nonce, .. } => {
            write_payload(stream, &Payload::Pong { nonce }).await.is_ok()
        }
        Payload::Pong { nonce } => match handler.on_pong(nonce) {
            Ok(()) => true,
            Err(offense) => {
                state.misbehavior.lock().unwrap().report(&peer, offense, now_ms());
                false
            }
        },
        Payload::SyncRequest { locators } => {
            let inventories = state
                .flow
                .get_sync_inventories(&locators, state.config.network.num_of_sync_blocks_limit);
            write_payload(stream, &Payload::SyncResponse { inventories }).await.is_ok()
        }
        Payload::SyncResponse { inventories } => {
            let missing: Vec<Hash256> = inventories
                .into_iter()
                .flatten()
                .filter(|h| !state.flow.contains(h))
                .collect::<HashSet<_>>()
                .into_iter()
                .take(state.config.network.num_of_sync_blocks_limit)
                .collect();
            if missing.is_empty() {
                true
            } else {
                write_payload(stream, &Payload::GetBlocks(missing)).await.is_ok()
            }
        }
        Payload::GetBlocks(hashes) => {
            let blocks: Vec<Block> = hashes
                .iter()
                .take(state.config.network.num_of_sync_blocks_limit)
                .filter_map(|h| state.flow.get_block(h))
                .collect();
            write_payload(stream, &Payload::SendBlocks(blocks)).await.is_ok()
        }
        Payload::SendBlocks(blocks) => handle_incoming_blocks(stream, state, &peer, blocks).await,
        Payload::NewBlock(block) => {
            handle_incoming_blocks(stream, state, &peer, vec![block]).await
        }
        Payload::NewTransactions(txs) => {
            state.handle_transactions(&txs, now_ms());
            true
        }
    }
}

async fn handle_incoming_blocks(
    stream: &mut TcpStream,
    state: &Arc<NodeState>,
    peer: &str,
    blocks: Vec<Block>,
) -> bool {
    let mut to_request = Vec::new();
    for block in blocks {
        match state.handle_block(&block) {
            BlockOutcome::Accepted(_) | BlockOutcome::Ignored => {}
            BlockOutcome::Missing(hash) => to_request.push(hash),
            BlockOutcome::Rejected(e) => {
                tracing::warn!("❌ Block from {} rejected: {}", peer, e);
                if e.is_validation() {
                    state.misbehavior.lock().unwrap().report(peer, Offense::InvalidBlock, now_ms());
                }
            }
        }
    }
    if to_request.is_empty() {
        return true;
    }
    write_payload(stream, &Payload::GetBlocks(to_request)).await.is_ok()
}
