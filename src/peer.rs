//! In-memory storage peers.
//!
//! Each [`MemoryPeer`] is a task that owns a quota-checked [`ShardStore`] and
//! an Ed25519 identity, and serves requests arriving on an `mpsc` channel,
//! answering each through a `oneshot`. [`MemoryNetwork`] routes
//! [`PeerTransport`] calls to these tasks by address.
//!
//! Peers support fault injection (going silent, refusing uploads, corrupting
//! or losing shards, answering slowly, keeping only a shard's digest) so
//! retrieval, placement and audit behavior can be exercised deterministically.

use crate::integrity::{self, Digest};
use crate::manifest::FileId;
use crate::registry::{PeerId, PeerRecord, PeerRegistry};
use crate::transport::{AuditChallenge, AuditProof, PeerTransport, PutAck, PutShard};
use crate::{Result, VaultError};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Requests queued per peer before senders wait.
const PEER_CHANNEL_CAPACITY: usize = 64;

/// A shard held by a peer.
#[derive(Debug, Clone)]
struct StoredShard {
    bytes: Vec<u8>,
    content_digest: Digest,
}

/// Usage summary of a [`ShardStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub shard_count: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Peer-side shard storage with a byte quota.
#[derive(Debug)]
pub struct ShardStore {
    capacity: u64,
    used: u64,
    shards: HashMap<(FileId, u16), StoredShard>,
}

impl ShardStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            shards: HashMap::new(),
        }
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Stores a shard after checking its digest and the quota.
    ///
    /// Returns the refusal reason on failure. Re-storing the same shard
    /// replaces it.
    pub fn put(&mut self, request: PutShard) -> std::result::Result<PutAck, String> {
        if integrity::digest(&request.bytes) != request.content_digest {
            return Err("content digest mismatch".to_string());
        }
        let key = (request.file_id, request.shard_index);
        let replaced = self.shards.get(&key).map(|s| s.bytes.len() as u64).unwrap_or(0);
        let size = request.bytes.len() as u64;
        if size > self.available() + replaced {
            return Err(format!(
                "storage quota exceeded: need {size} bytes, {} available",
                self.available() + replaced
            ));
        }
        self.used = self.used - replaced + size;
        self.shards.insert(
            key,
            StoredShard {
                bytes: request.bytes,
                content_digest: request.content_digest,
            },
        );
        Ok(PutAck {
            stored_bytes: size,
            available_storage: self.available(),
        })
    }

    pub fn get(&self, file_id: &FileId, shard_index: u16) -> Option<&[u8]> {
        self.shards
            .get(&(*file_id, shard_index))
            .map(|s| s.bytes.as_slice())
    }

    pub fn delete(&mut self, file_id: &FileId, shard_index: u16) -> bool {
        match self.shards.remove(&(*file_id, shard_index)) {
            Some(shard) => {
                self.used -= shard.bytes.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Proof of possession, computed over the bytes actually held.
    pub fn prove(&self, challenge: &AuditChallenge) -> Option<Digest> {
        self.get(&challenge.file_id, challenge.shard_index)
            .map(|bytes| integrity::audit_proof(bytes, &challenge.nonce))
    }

    pub fn content_digest(&self, file_id: &FileId, shard_index: u16) -> Option<Digest> {
        self.shards
            .get(&(*file_id, shard_index))
            .map(|s| s.content_digest)
    }

    /// Flips one bit of a stored shard, leaving the recorded digest alone.
    fn corrupt(&mut self, file_id: &FileId, shard_index: u16) -> bool {
        match self.shards.get_mut(&(*file_id, shard_index)) {
            Some(shard) if !shard.bytes.is_empty() => {
                shard.bytes[0] ^= 0x01;
                trace!(recorded = ?shard.content_digest, "shard corrupted");
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            shard_count: self.shards.len(),
            used_bytes: self.used,
            capacity_bytes: self.capacity,
        }
    }
}

/// Injected misbehavior.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Stop answering; requests are dropped unanswered
    Offline(bool),
    /// Refuse every upload
    RejectUploads(bool),
    /// Delay every answer
    Latency(Duration),
    /// Silently flip a bit in a stored shard
    CorruptShard { file_id: FileId, shard_index: u16 },
    /// Silently lose a stored shard
    DropShard { file_id: FileId, shard_index: u16 },
    /// Free the shard's space but keep its digest and keep answering audits
    /// from the digest
    KeepDigestOnly { file_id: FileId, shard_index: u16 },
}

enum PeerRequest {
    Put {
        request: PutShard,
        reply: oneshot::Sender<Result<PutAck>>,
    },
    Get {
        file_id: FileId,
        shard_index: u16,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Audit {
        challenge: AuditChallenge,
        reply: oneshot::Sender<Result<AuditProof>>,
    },
    Delete {
        file_id: FileId,
        shard_index: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
    Inject {
        fault: Fault,
        reply: oneshot::Sender<()>,
    },
}

/// The peer task's state.
pub struct MemoryPeer {
    address: String,
    signing_key: SigningKey,
    store: ShardStore,
    offline: bool,
    reject_uploads: bool,
    latency: Duration,
    /// Digests kept for shards whose bytes were thrown away
    hoarded: HashMap<(FileId, u16), Digest>,
}

impl MemoryPeer {
    /// Spawns a peer with a random identity.
    pub fn spawn(address: impl Into<String>, capacity: u64) -> PeerHandle {
        Self::spawn_with_key(address, capacity, SigningKey::generate(&mut OsRng))
    }

    /// Spawns a peer with a fixed identity (deterministic ids in tests).
    pub fn spawn_with_key(address: impl Into<String>, capacity: u64, signing_key: SigningKey) -> PeerHandle {
        let address = address.into();
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let public_key = signing_key.verifying_key().to_bytes();
        let peer = MemoryPeer {
            address: address.clone(),
            signing_key,
            store: ShardStore::new(capacity),
            offline: false,
            reject_uploads: false,
            latency: Duration::ZERO,
            hoarded: HashMap::new(),
        };
        tokio::spawn(peer.run(receiver));
        PeerHandle {
            address,
            public_key,
            capacity,
            sender,
        }
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<PeerRequest>) {
        while let Some(request) = receiver.recv().await {
            self.handle(request).await;
        }
        debug!(address = %self.address, "peer task stopped");
    }

    async fn handle(&mut self, request: PeerRequest) {
        // Control requests are answered even while offline
        let request = match request {
            PeerRequest::Inject { fault, reply } => {
                self.inject(fault);
                let _ = reply.send(());
                return;
            }
            PeerRequest::Stats { reply } => {
                let _ = reply.send(self.store.stats());
                return;
            }
            other => other,
        };
        if self.offline {
            // Dropping the reply sender is all the caller ever sees
            trace!(address = %self.address, "offline, request dropped");
            return;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match request {
            PeerRequest::Put { request, reply } => {
                let result = if self.reject_uploads {
                    Err(self.rejected("uploads disabled"))
                } else {
                    self.store.put(request).map_err(|reason| self.rejected(&reason))
                };
                let _ = reply.send(result);
            }
            PeerRequest::Get {
                file_id,
                shard_index,
                reply,
            } => {
                let result = self
                    .store
                    .get(&file_id, shard_index)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| VaultError::ShardNotFound {
                        file_id: file_id.to_string(),
                        shard_index,
                    });
                let _ = reply.send(result);
            }
            PeerRequest::Audit { challenge, reply } => {
                let key = (challenge.file_id, challenge.shard_index);
                let proof = self.store.prove(&challenge).or_else(|| {
                    self.hoarded
                        .get(&key)
                        .map(|digest| integrity::audit_proof(digest.as_bytes(), &challenge.nonce))
                });
                let result = match proof {
                    Some(proof) => {
                        let signature = self
                            .signing_key
                            .sign(&challenge.signing_message(&proof))
                            .to_bytes()
                            .to_vec();
                        Ok(AuditProof { proof, signature })
                    }
                    None => Err(VaultError::ShardNotFound {
                        file_id: challenge.file_id.to_string(),
                        shard_index: challenge.shard_index,
                    }),
                };
                let _ = reply.send(result);
            }
            PeerRequest::Delete {
                file_id,
                shard_index,
                reply,
            } => {
                self.store.delete(&file_id, shard_index);
                self.hoarded.remove(&(file_id, shard_index));
                let _ = reply.send(Ok(()));
            }
            PeerRequest::Stats { .. } | PeerRequest::Inject { .. } => {}
        }
    }

    fn inject(&mut self, fault: Fault) {
        debug!(address = %self.address, ?fault, "fault injected");
        match fault {
            Fault::Offline(offline) => self.offline = offline,
            Fault::RejectUploads(reject) => self.reject_uploads = reject,
            Fault::Latency(latency) => self.latency = latency,
            Fault::CorruptShard {
                file_id,
                shard_index,
            } => {
                self.store.corrupt(&file_id, shard_index);
            }
            Fault::DropShard {
                file_id,
                shard_index,
            } => {
                self.store.delete(&file_id, shard_index);
            }
            Fault::KeepDigestOnly {
                file_id,
                shard_index,
            } => {
                if let Some(digest) = self.store.content_digest(&file_id, shard_index) {
                    self.store.delete(&file_id, shard_index);
                    self.hoarded.insert((file_id, shard_index), digest);
                }
            }
        }
    }

    fn rejected(&self, reason: &str) -> VaultError {
        VaultError::Rejected {
            peer_id: PeerId::from_public_key(&self.signing_key.verifying_key().to_bytes()).to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Client side of a [`MemoryPeer`].
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub address: String,
    pub public_key: [u8; 32],
    pub capacity: u64,
    sender: mpsc::Sender<PeerRequest>,
}

impl PeerHandle {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PeerRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        let unreachable = || VaultError::Unreachable {
            peer_id: self.peer_id().to_string(),
        };
        self.sender.send(build(reply)).await.map_err(|_| unreachable())?;
        response.await.map_err(|_| unreachable())
    }

    pub async fn inject(&self, fault: Fault) -> Result<()> {
        self.call(|reply| PeerRequest::Inject { fault, reply }).await
    }

    pub async fn set_offline(&self, offline: bool) -> Result<()> {
        self.inject(Fault::Offline(offline)).await
    }

    pub async fn set_reject_uploads(&self, reject: bool) -> Result<()> {
        self.inject(Fault::RejectUploads(reject)).await
    }

    pub async fn set_latency(&self, latency: Duration) -> Result<()> {
        self.inject(Fault::Latency(latency)).await
    }

    pub async fn corrupt_shard(&self, file_id: FileId, shard_index: u16) -> Result<()> {
        self.inject(Fault::CorruptShard {
            file_id,
            shard_index,
        })
        .await
    }

    pub async fn drop_shard(&self, file_id: FileId, shard_index: u16) -> Result<()> {
        self.inject(Fault::DropShard {
            file_id,
            shard_index,
        })
        .await
    }

    pub async fn keep_digest_only(&self, file_id: FileId, shard_index: u16) -> Result<()> {
        self.inject(Fault::KeepDigestOnly {
            file_id,
            shard_index,
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.call(|reply| PeerRequest::Stats { reply }).await
    }
}

/// Routes transport calls to in-memory peers by address.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: PeerHandle) {
        self.peers.write().insert(handle.address.clone(), handle);
    }

    /// Removes a peer from routing; later calls to it are unreachable.
    pub fn disconnect(&self, address: &str) -> Option<PeerHandle> {
        self.peers.write().remove(address)
    }

    pub fn handle(&self, address: &str) -> Option<PeerHandle> {
        self.peers.read().get(address).cloned()
    }

    /// Handle of a registered peer by id.
    pub fn handle_for(&self, peer_id: &PeerId) -> Option<PeerHandle> {
        self.peers
            .read()
            .values()
            .find(|h| &h.peer_id() == peer_id)
            .cloned()
    }

    /// Spawns a peer, routes to it and registers it with the coordinator.
    pub async fn spawn_peer(
        &self,
        registry: &dyn PeerRegistry,
        address: impl Into<String>,
        capacity: u64,
    ) -> Result<(PeerId, PeerHandle)> {
        self.register(registry, MemoryPeer::spawn(address, capacity)).await
    }

    /// Routes to and registers an already spawned peer.
    pub async fn register(
        &self,
        registry: &dyn PeerRegistry,
        handle: PeerHandle,
    ) -> Result<(PeerId, PeerHandle)> {
        let peer_id = registry
            .register_peer(handle.public_key, handle.address.clone(), handle.capacity)
            .await?;
        self.add(handle.clone());
        Ok((peer_id, handle))
    }

    fn route(&self, peer: &PeerRecord) -> Result<PeerHandle> {
        self.handle(&peer.address).ok_or_else(|| VaultError::Unreachable {
            peer_id: peer.peer_id.to_string(),
        })
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn put_shard(&self, peer: &PeerRecord, request: PutShard) -> Result<PutAck> {
        let handle = self.route(peer)?;
        handle
            .call(|reply| PeerRequest::Put { request, reply })
            .await?
    }

    async fn get_shard(
        &self,
        peer: &PeerRecord,
        file_id: &FileId,
        shard_index: u16,
    ) -> Result<Vec<u8>> {
        let handle = self.route(peer)?;
        let file_id = *file_id;
        handle
            .call(|reply| PeerRequest::Get {
                file_id,
                shard_index,
                reply,
            })
            .await?
    }

    async fn audit_challenge(
        &self,
        peer: &PeerRecord,
        challenge: &AuditChallenge,
    ) -> Result<AuditProof> {
        let handle = self.route(peer)?;
        let challenge = challenge.clone();
        handle
            .call(|reply| PeerRequest::Audit { challenge, reply })
            .await?
    }

    async fn delete_shard(
        &self,
        peer: &PeerRecord,
        file_id: &FileId,
        shard_index: u16,
    ) -> Result<()> {
        let handle = self.route(peer)?;
        let file_id = *file_id;
        handle
            .call(|reply| PeerRequest::Delete {
                file_id,
                shard_index,
                reply,
            })
            .await?
    }
}
