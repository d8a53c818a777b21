//! Block assembly from fragment envelopes
//!
//! One receiver per region. Envelopes announcing the same block number,
//! root, size and shard layout share one [`Context`]; different roots for
//! one number are assembled side by side and the first to regenerate a valid
//! block wins. Completed blocks ahead of their predecessors are parked until
//! the gap closes.
//!
//! Only block numbers in `[next_expected, next_expected + window)` are
//! accepted. Sessions hold leased codecs, so a session is dropped when its
//! block is delivered, when its fragments fail before any verified, or when
//! a lower block needs its codecs.

use crate::context::Context;
use crate::envelope::{EnvelopeHeader, FragmentEnvelope};
use crate::generator::FragmentGenerator;
use crate::{ReplicatorError, Result};
use bytes::Bytes;
use fragcast_core::config::FragmentConfig;
use fragcast_core::digest::{short_hex, HashString};
use fragcast_storage::{Block, BlockStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Block numbers accepted above the next expected one
pub const DEFAULT_WINDOW: u64 = 64;

/// What happened to a received envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The block is already stored or parked
    Stale,
    /// The block is too far ahead of the store and was dropped
    Ahead { next_expected: u64 },
    /// Fragments stored, block not yet complete
    Pending { verified: usize },
    /// The block was regenerated; it is stored or parked behind a gap
    Completed { block_number: u64 },
}

/// Everything an envelope announces about the message it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SessionKey {
    number: u64,
    root: HashString,
    message_size: u64,
    data_shards: u32,
    parity_shards: u32,
    instance_count: u32,
}

impl SessionKey {
    fn of(header: &EnvelopeHeader) -> Self {
        Self {
            number: header.block_number,
            root: header.root,
            message_size: header.message_size,
            data_shards: header.data_shards,
            parity_shards: header.parity_shards,
            instance_count: header.instance_count,
        }
    }

    /// Smallest key for `number`
    fn first_of(number: u64) -> Self {
        Self {
            number,
            root: HashString::default(),
            message_size: 0,
            data_shards: 0,
            parity_shards: 0,
            instance_count: 0,
        }
    }
}

struct PendingBlock {
    key: SessionKey,
    context: Context,
    regenerating: AtomicBool,
}

/// Assembles blocks of one region
pub struct BlockReceiver {
    region: usize,
    local: FragmentConfig,
    generator: Arc<FragmentGenerator>,
    store: Arc<BlockStore>,
    context_timeout: Option<Duration>,
    window: u64,
    pending: Mutex<BTreeMap<SessionKey, Arc<PendingBlock>>>,
    parked: Mutex<BTreeMap<u64, Block>>,
}

impl BlockReceiver {
    /// `local` supplies the backend; shard counts come from each envelope
    pub fn new(
        region: usize,
        local: FragmentConfig,
        generator: Arc<FragmentGenerator>,
        store: Arc<BlockStore>,
    ) -> Self {
        Self {
            region,
            local,
            generator,
            store,
            context_timeout: None,
            window: DEFAULT_WINDOW,
            pending: Mutex::new(BTreeMap::new()),
            parked: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bound the wait for free codecs when a new session starts
    pub fn with_context_timeout(mut self, timeout: Duration) -> Self {
        self.context_timeout = Some(timeout);
        self
    }

    /// Accept block numbers up to `window - 1` above the next expected one
    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn region(&self) -> usize {
        self.region
    }

    /// Sessions with fragments but no regenerated message yet
    pub fn pending_blocks(&self) -> usize {
        self.pending.lock().len()
    }

    /// Regenerated blocks waiting for a predecessor
    pub fn parked_blocks(&self) -> usize {
        self.parked.lock().len()
    }

    fn next_expected(&self) -> Result<u64> {
        Ok(self
            .store
            .get_max_stored_block_number(self.region)?
            .map_or(0, |max| max + 1))
    }

    /// Decode and handle a raw envelope from `peer`
    pub fn receive(&self, peer: &str, raw: Bytes) -> Result<ReceiveOutcome> {
        self.receive_envelope(peer, FragmentEnvelope::decode(raw)?)
    }

    pub fn receive_envelope(
        &self,
        peer: &str,
        envelope: FragmentEnvelope,
    ) -> Result<ReceiveOutcome> {
        let FragmentEnvelope { header, payload } = envelope;
        let number = header.block_number;
        let next_expected = {
            let parked = self.parked.lock();
            let next_expected = self.next_expected()?;
            if number < next_expected || parked.contains_key(&number) {
                debug!(region = self.region, number, peer, "Dropping stale envelope");
                return Ok(ReceiveOutcome::Stale);
            }
            next_expected
        };
        if number - next_expected >= self.window {
            warn!(
                region = self.region,
                number,
                next_expected,
                peer,
                "Dropping envelope ahead of the receive window"
            );
            return Ok(ReceiveOutcome::Ahead { next_expected });
        }

        let Some(pending) = self.pending_for(&header)? else {
            return Ok(ReceiveOutcome::Stale);
        };
        let range = header.range();
        if let Err(err) = pending.context.validate_fragments_from(
            Some(peer),
            &pending.key.root,
            payload,
            range.start,
            range.end,
        ) {
            self.discard_if_empty(pending);
            return Err(err);
        }

        if !pending.context.is_ready()
            || pending
                .regenerating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Ok(ReceiveOutcome::Pending {
                verified: pending.context.verified_fragments(),
            });
        }

        let block = match self.regenerate(&pending) {
            Ok(block) => block,
            Err(err) => {
                // k verified fragments that do not decode to the announced block
                warn!(
                    region = self.region,
                    number,
                    root = %short_hex(&pending.key.root),
                    error = %err,
                    "Discarding session that regenerated an invalid block"
                );
                self.remove_session(&pending);
                return Err(err);
            }
        };

        {
            let mut parked = self.parked.lock();
            if number < self.next_expected()? || parked.contains_key(&number) {
                drop(parked);
                self.remove_session(&pending);
                return Ok(ReceiveOutcome::Stale);
            }
            // Park before dropping sessions so late envelopes read as stale
            parked.insert(number, block);
        }
        self.drop_sessions_for(number, &pending.key);
        drop(pending);

        self.flush()?;
        Ok(ReceiveOutcome::Completed {
            block_number: number,
        })
    }

    /// Existing session for the header's announcement, or a new one
    ///
    /// `None` when the block completed while codecs were being leased.
    fn pending_for(&self, header: &EnvelopeHeader) -> Result<Option<Arc<PendingBlock>>> {
        let key = SessionKey::of(header);
        if let Some(existing) = self.pending.lock().get(&key) {
            return Ok(Some(existing.clone()));
        }

        // Acquire codecs without holding the map lock
        let config = header.fragment_config(&self.local);
        let context = self.lease_context(key.number, &config)?;

        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(&key) {
            return Ok(Some(existing.clone()));
        }
        // Parked blocks move to the store under this lock
        let parked = self.parked.lock();
        if key.number < self.next_expected()? || parked.contains_key(&key.number) {
            debug!(
                region = self.region,
                number = key.number,
                "Block completed while leasing codecs"
            );
            return Ok(None);
        }
        drop(parked);
        let fresh = Arc::new(PendingBlock {
            key,
            context,
            regenerating: AtomicBool::new(false),
        });
        pending.insert(key, fresh.clone());
        let announcements = pending
            .range(SessionKey::first_of(key.number)..)
            .take_while(|(other, _)| other.number == key.number)
            .count();
        if announcements > 1 {
            debug!(
                region = self.region,
                number = key.number,
                root = %short_hex(&key.root),
                announcements,
                "Competing announcement for block"
            );
        }
        Ok(Some(fresh))
    }

    /// Lease a context for block `number`, evicting sessions of later blocks
    /// when the pool is dry
    fn lease_context(&self, number: u64, config: &FragmentConfig) -> Result<Context> {
        loop {
            match self
                .generator
                .get_empty_context_timeout(config, Duration::ZERO)
            {
                Err(ReplicatorError::Timeout) => {}
                other => return other,
            }
            if !self.evict_after(number, config) {
                break;
            }
        }
        match self.context_timeout {
            Some(timeout) => self.generator.get_empty_context_timeout(config, timeout),
            None => self.generator.get_empty_context(config),
        }
    }

    /// Drop the session of the highest block above `number` sharing
    /// `config`'s codec pool
    fn evict_after(&self, number: u64, config: &FragmentConfig) -> bool {
        let erasure = config.erasure();
        let mut pending = self.pending.lock();
        let victim = pending
            .iter()
            .rev()
            .take_while(|(key, _)| key.number > number)
            .find(|(_, session)| session.context.config().erasure() == erasure)
            .map(|(key, _)| *key);
        match victim {
            Some(key) => {
                pending.remove(&key);
                warn!(
                    region = self.region,
                    evicted = key.number,
                    needed_by = number,
                    "Evicted pending block to free codecs"
                );
                true
            }
            None => false,
        }
    }

    /// Drop a session none of whose fragments verified
    fn discard_if_empty(&self, session: Arc<PendingBlock>) {
        let mut pending = self.pending.lock();
        let Some(current) = pending.get(&session.key) else {
            return;
        };
        // The map and this caller hold the only references, so no other
        // validation is in flight
        if Arc::ptr_eq(current, &session)
            && Arc::strong_count(&session) == 2
            && session.context.verified_fragments() == 0
        {
            pending.remove(&session.key);
            debug!(
                region = self.region,
                number = session.key.number,
                "Dropped session with no verified fragments"
            );
        }
    }

    fn remove_session(&self, session: &Arc<PendingBlock>) {
        let mut pending = self.pending.lock();
        if pending
            .get(&session.key)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            pending.remove(&session.key);
        }
    }

    /// Drop every session for `number`; competing roots lost
    fn drop_sessions_for(&self, number: u64, winner: &SessionKey) {
        let mut pending = self.pending.lock();
        let losers: Vec<SessionKey> = pending
            .range(SessionKey::first_of(number)..)
            .take_while(|(key, _)| key.number == number)
            .map(|(key, _)| *key)
            .collect();
        for key in losers {
            pending.remove(&key);
            if key != *winner {
                info!(
                    region = self.region,
                    number,
                    root = %short_hex(&key.root),
                    "Dropped competing announcement"
                );
            }
        }
    }

    fn regenerate(&self, pending: &PendingBlock) -> Result<Block> {
        let number = pending.key.number;
        let mut raw = Vec::new();
        pending
            .context
            .regenerate_message(pending.key.message_size as usize, &mut raw)?;
        let block = Block::decode(&raw)?;
        if block.number() != number {
            return Err(ReplicatorError::UnexpectedBlock {
                expected: number,
                actual: block.number(),
            });
        }
        if !block.verify_data_hash() {
            return Err(ReplicatorError::malformed(format!(
                "block {} body does not match its data hash",
                number
            )));
        }
        Ok(block)
    }

    /// Insert parked blocks that are next in line, then drop what fell
    /// below the watermark
    fn flush(&self) -> Result<()> {
        let next = {
            let mut parked = self.parked.lock();
            let mut next = self.next_expected()?;
            while let Some(block) = parked.remove(&next) {
                self.store.insert_block_and_notify(self.region, block)?;
                info!(region = self.region, number = next, "Block delivered");
                next += 1;
            }
            *parked = parked.split_off(&next);
            if let Some(first) = parked.keys().next() {
                debug!(
                    region = self.region,
                    parked = parked.len(),
                    first,
                    "Blocks waiting for a predecessor"
                );
            }
            next
        };

        let mut pending = self.pending.lock();
        let before = pending.len();
        *pending = pending.split_off(&SessionKey::first_of(next));
        if pending.len() < before {
            debug!(
                region = self.region,
                dropped = before - pending.len(),
                "Dropped sessions below the watermark"
            );
        }
        Ok(())
    }
}
