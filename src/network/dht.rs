//! DHT transport boundary
//!
//! The engine only ever talks to a `DhtTransport`: immutable items are
//! addressed by content hash, mutable items by publisher key plus salt.
//! Requests never block; replies arrive later as `DhtEvent`s on the channel
//! handed over with the request and are consumed by the next tick.

use crate::account::KeyPair;
use crate::core::transaction::put_bytes;
use crate::core::{ChainId, Hash, PublicKey};
use crate::error::{ChainError, Result};
use crate::utils::ecdsa_p256_sha256_sign_verify;
use log::{trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Mutable-item channels every chain publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    BlockTip,
    BlockRequest,
    TxTip,
    TxRequest,
}

impl Channel {
    fn tag(&self) -> &'static [u8] {
        match self {
            Channel::BlockTip => b"#block-tip",
            Channel::BlockRequest => b"#block-request",
            Channel::TxTip => b"#tx-tip",
            Channel::TxRequest => b"#tx-request",
        }
    }

    /// `chain_id ∥ channel tag`
    pub fn salt(&self, chain_id: &ChainId) -> Vec<u8> {
        let mut salt = chain_id.as_bytes().to_vec();
        salt.extend_from_slice(self.tag());
        salt
    }
}

/// What a reply answers, so the worker knows how to consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestContext {
    TipBlock { peer: PublicKey },
    VoteTip { peer: PublicKey },
    TipTx { peer: PublicKey },
    BlockRequest { peer: PublicKey },
    TxRequest { peer: PublicKey },
    Block { hash: Hash },
    Tx { hash: Hash },
}

#[derive(Debug, Clone)]
pub struct DhtEvent {
    pub context: RequestContext,
    /// `None` when nothing is stored at the address
    pub payload: Option<Vec<u8>>,
}

/// Signed latest-value record at `(public_key, salt)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    pub public_key: PublicKey,
    pub salt: Vec<u8>,
    pub seq: i64,
    pub value: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MutableItem {
    pub fn new_signed(key_pair: &KeyPair, salt: Vec<u8>, seq: i64, value: Vec<u8>) -> Result<MutableItem> {
        let mut item = MutableItem {
            public_key: key_pair.public_key(),
            salt,
            seq,
            value,
            signature: vec![],
        };
        item.signature = key_pair.sign(&item.preimage())?;
        Ok(item)
    }

    fn preimage(&self) -> Vec<u8> {
        let mut data = vec![];
        put_bytes(&mut data, &self.salt);
        data.extend(self.seq.to_be_bytes());
        put_bytes(&mut data, &self.value);
        data
    }

    pub fn verify(&self) -> bool {
        ecdsa_p256_sha256_sign_verify(self.public_key.as_bytes(), &self.signature, &self.preimage())
    }
}

pub trait DhtTransport: Send + Sync {
    /// Fetch the item stored under `hash`.
    fn request_immutable(&self, hash: Hash, context: RequestContext, reply: Sender<DhtEvent>);

    /// Fetch the latest item published by `public_key` under `salt`.
    fn request_mutable(
        &self,
        public_key: &PublicKey,
        salt: &[u8],
        context: RequestContext,
        reply: Sender<DhtEvent>,
    );

    /// Publish `value` under its content hash `key`. Readers check the key
    /// against the decoded item.
    fn put_immutable(&self, key: Hash, value: Vec<u8>) -> Result<()>;

    fn put_mutable(&self, item: MutableItem) -> Result<()>;

    /// Outstanding requests, for tick backpressure.
    fn queue_len(&self) -> usize;

    fn queue_capacity(&self) -> usize;
}

enum Lookup {
    Immutable(Hash),
    Mutable(PublicKey, Vec<u8>),
}

struct PendingRequest {
    lookup: Lookup,
    context: RequestContext,
    reply: Sender<DhtEvent>,
}

#[derive(Default)]
struct MemoryDhtInner {
    immutable: HashMap<Hash, Vec<u8>>,
    mutable: HashMap<(PublicKey, Vec<u8>), MutableItem>,
    queue: VecDeque<PendingRequest>,
}

/// In-process DHT shared by every node of a test or devnet.
///
/// Requests queue up until `pump` answers them, which keeps replies
/// asynchronous and lets tests interleave nodes deterministically.
pub struct MemoryDht {
    inner: Mutex<MemoryDhtInner>,
    capacity: usize,
}

impl MemoryDht {
    pub fn new(capacity: usize) -> MemoryDht {
        MemoryDht {
            inner: Mutex::new(MemoryDhtInner::default()),
            capacity,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryDhtInner>> {
        self.inner
            .lock()
            .map_err(|e| ChainError::Network(format!("DHT lock poisoned: {e}")))
    }

    fn enqueue(&self, request: PendingRequest) {
        match self.lock() {
            Ok(mut inner) => {
                if inner.queue.len() >= self.capacity {
                    warn!("DHT queue full, dropping {:?}", request.context);
                    return;
                }
                inner.queue.push_back(request);
            }
            Err(e) => warn!("{e}"),
        }
    }

    /// Answer every queued request. Replies to dropped receivers are discarded.
    pub fn pump(&self) -> usize {
        let (requests, answers) = match self.lock() {
            Ok(mut inner) => {
                let requests: Vec<PendingRequest> = inner.queue.drain(..).collect();
                let answers: Vec<Option<Vec<u8>>> = requests
                    .iter()
                    .map(|request| match &request.lookup {
                        Lookup::Immutable(hash) => inner.immutable.get(hash).cloned(),
                        Lookup::Mutable(public_key, salt) => inner
                            .mutable
                            .get(&(public_key.clone(), salt.clone()))
                            .map(|item| item.value.clone()),
                    })
                    .collect();
                (requests, answers)
            }
            Err(e) => {
                warn!("{e}");
                return 0;
            }
        };

        let answered = requests.len();
        for (request, payload) in requests.into_iter().zip(answers) {
            trace!("DHT answering {:?} (found: {})", request.context, payload.is_some());
            // the requester may have stopped
            let _ = request.reply.send(DhtEvent {
                context: request.context,
                payload,
            });
        }
        answered
    }

    pub fn contains_immutable(&self, key: &Hash) -> bool {
        self.lock()
            .map(|inner| inner.immutable.contains_key(key))
            .unwrap_or(false)
    }
}

impl DhtTransport for MemoryDht {
    fn request_immutable(&self, hash: Hash, context: RequestContext, reply: Sender<DhtEvent>) {
        self.enqueue(PendingRequest {
            lookup: Lookup::Immutable(hash),
            context,
            reply,
        });
    }

    fn request_mutable(
        &self,
        public_key: &PublicKey,
        salt: &[u8],
        context: RequestContext,
        reply: Sender<DhtEvent>,
    ) {
        self.enqueue(PendingRequest {
            lookup: Lookup::Mutable(public_key.clone(), salt.to_vec()),
            context,
            reply,
        });
    }

    fn put_immutable(&self, key: Hash, value: Vec<u8>) -> Result<()> {
        self.lock()?.immutable.insert(key, value);
        Ok(())
    }

    fn put_mutable(&self, item: MutableItem) -> Result<()> {
        if !item.verify() {
            return Err(ChainError::Network(
                "Mutable item signature does not verify".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        let address = (item.public_key.clone(), item.salt.clone());
        let newer = inner
            .mutable
            .get(&address)
            .map(|current| item.seq >= current.seq)
            .unwrap_or(true);
        if newer {
            inner.mutable.insert(address, item);
        }
        Ok(())
    }

    fn queue_len(&self) -> usize {
        self.lock().map(|inner| inner.queue.len()).unwrap_or(0)
    }

    fn queue_capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_salts_differ_per_channel_and_chain() {
        let a = ChainId::new(b"a".to_vec());
        let b = ChainId::new(b"b".to_vec());
        assert_ne!(Channel::BlockTip.salt(&a), Channel::TxTip.salt(&a));
        assert_ne!(Channel::BlockTip.salt(&a), Channel::BlockTip.salt(&b));
        assert!(Channel::BlockTip.salt(&a).starts_with(b"a"));
    }

    #[test]
    fn test_replies_wait_for_pump() {
        let dht = MemoryDht::new(16);
        let (sender, receiver) = channel();
        let key = Hash::digest(b"value");
        dht.put_immutable(key, b"value".to_vec()).unwrap();
        dht.request_immutable(key, RequestContext::Block { hash: key }, sender.clone());
        dht.request_immutable(
            Hash::digest(b"missing"),
            RequestContext::Block { hash: key },
            sender,
        );

        assert!(receiver.try_recv().is_err());
        assert_eq!(dht.queue_len(), 2);
        assert_eq!(dht.pump(), 2);

        assert_eq!(receiver.try_recv().unwrap().payload, Some(b"value".to_vec()));
        assert_eq!(receiver.try_recv().unwrap().payload, None);
    }

    #[test]
    fn test_mutable_items_keep_latest_signed_value() {
        let dht = MemoryDht::new(16);
        let publisher = KeyPair::generate().unwrap();
        let salt = b"chan".to_vec();
        dht.put_mutable(MutableItem::new_signed(&publisher, salt.clone(), 2, b"new".to_vec()).unwrap())
            .unwrap();
        dht.put_mutable(MutableItem::new_signed(&publisher, salt.clone(), 1, b"old".to_vec()).unwrap())
            .unwrap();

        let mut forged = MutableItem::new_signed(&publisher, salt.clone(), 3, b"x".to_vec()).unwrap();
        forged.value = b"forged".to_vec();
        assert!(dht.put_mutable(forged).is_err());

        let (sender, receiver) = channel();
        let peer = publisher.public_key();
        dht.request_mutable(&peer, &salt, RequestContext::TipBlock { peer: peer.clone() }, sender);
        dht.pump();
        assert_eq!(receiver.try_recv().unwrap().payload, Some(b"new".to_vec()));
    }

    #[test]
    fn test_full_queue_drops_requests() {
        let dht = MemoryDht::new(1);
        let (sender, _receiver) = channel();
        let key = Hash::digest(b"k");
        dht.request_immutable(key, RequestContext::Tx { hash: key }, sender.clone());
        dht.request_immutable(key, RequestContext::Tx { hash: key }, sender);
        assert_eq!(dht.queue_len(), 1);
        assert_eq!(dht.queue_capacity(), 1);
    }
}
