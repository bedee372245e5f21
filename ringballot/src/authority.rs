//! The authority node: turns mixnet output into blocks and reconciles its chain with peers.
//!
//! Drain and sync are independent cycles. Each is non-reentrant: a tick that arrives while the
//! previous cycle of the same kind is still running is skipped, never queued. Replica nodes
//! hold no signing key and only sync.

use crate::*;
use ed25519_dalek::SigningKey;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub enum NodeRole {
    /// May append blocks, signed with this key
    Authority(SigningKey),

    /// Read-only copy of the chain
    Replica,
}

/// A source of chains to reconcile with
pub trait Peer: Send + Sync {
    fn id(&self) -> String;

    /// The peer's full chain, genesis first
    fn chain(&self) -> Result<Vec<Block>>;
}

/// A ballot a drain cycle refused, and why
#[derive(Debug)]
pub struct RejectedBallot {
    pub key_image: String,
    pub reason: Error,
}

/// The outcome of one drain cycle
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Index and hash of the block committed this cycle, if any ballot was accepted
    pub block: Option<(u64, String)>,
    pub accepted: usize,
    pub rejected: Vec<RejectedBallot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The local chain was already at least as long as every valid peer chain
    Unchanged,

    /// Replaced the local chain with a peer's
    Adopted { peer: String, height: usize },
}

// Clears the in-flight flag when the cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AuthorityNode {
    id: String,
    role: NodeRole,
    params: Arc<ElectionParameters>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    mixnet: Arc<Mixnet>,

    // Single writer for the chain and its key-image set
    ledger: RwLock<Ledger>,

    peers: RwLock<Vec<Arc<dyn Peer>>>,
    draining: AtomicBool,
    syncing: AtomicBool,

    // Set once voting closes; the chain is frozen from then on
    closed: AtomicBool,
}

impl AuthorityNode {
    pub fn new(
        id: &str,
        role: NodeRole,
        params: Arc<ElectionParameters>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        mixnet: Arc<Mixnet>,
    ) -> Result<Self> {
        if let NodeRole::Authority(signing_key) = &role {
            if signing_key.verifying_key() != params.block_signer {
                return Err(ValidationError::MalformedKey(
                    "signing key does not match the election's block signer".to_owned(),
                )
                .into());
            }
        }

        let ledger = Ledger::new(params.metadata.id)?;
        Ok(AuthorityNode {
            id: id.to_owned(),
            role,
            params,
            config,
            clock,
            mixnet,
            ledger: RwLock::new(ledger),
            peers: RwLock::new(Vec::new()),
            draining: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_authority(&self) -> bool {
        matches!(self.role, NodeRole::Authority(_))
    }

    pub fn params(&self) -> &ElectionParameters {
        &self.params
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(peer);
    }

    /// A snapshot of the chain
    pub fn blocks(&self) -> Vec<Block> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks()
            .to_vec()
    }

    pub fn height(&self) -> usize {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner).height()
    }

    pub fn contains_key_image(&self, key_image: &[u8; 32]) -> bool {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key_image(key_image)
    }

    /// One drain cycle: validate everything the mixnet has released and commit the valid
    /// ballots as exactly one new block.
    ///
    /// Returns `Ok(None)` when skipped because the previous cycle is still in flight, or
    /// because the node is closed. Rejected ballots are reported, not requeued.
    pub fn drain(&self) -> Result<Option<DrainReport>> {
        let signing_key = self.signing_key()?;
        let _guard = match InFlight::enter(&self.draining) {
            Some(guard) => guard,
            None => {
                debug!("{}: drain tick skipped, previous cycle still running", self.id);
                return Ok(None);
            }
        };
        if self.is_closed() {
            debug!("{}: drain tick skipped, voting is closed", self.id);
            return Ok(None);
        }

        self.drain_released(signing_key).map(Some)
    }

    /// Freeze the chain for the tally: force the mixnet to release whatever it still holds,
    /// commit it in one last drain, and refuse every drain and sync after that.
    ///
    /// Waits for an in-flight drain to finish first. A replica has nothing to drain and is
    /// simply frozen. Calling it again returns an empty report.
    pub fn close(&self) -> Result<DrainReport> {
        let signing_key = match &self.role {
            NodeRole::Authority(key) => Some(key),
            NodeRole::Replica => None,
        };
        let _guard = loop {
            if let Some(guard) = InFlight::enter(&self.draining) {
                break guard;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        if self.is_closed() {
            return Ok(DrainReport::default());
        }

        let report = match signing_key {
            Some(signing_key) => {
                if let Some(release) = self.mixnet.flush() {
                    debug!("{}: final mixnet release {:?}", self.id, release);
                }
                self.drain_released(signing_key)?
            }
            None => DrainReport::default(),
        };

        self.closed.store(true, Ordering::Release);
        info!("{}: closed at height {}", self.id, self.height());
        Ok(report)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn signing_key(&self) -> Result<&SigningKey> {
        match &self.role {
            NodeRole::Authority(key) => Ok(key),
            NodeRole::Replica => Err(Error::NotAuthority),
        }
    }

    // The body of a drain cycle; the caller holds the in-flight guard.
    fn drain_released(&self, signing_key: &SigningKey) -> Result<DrainReport> {
        // Held for the whole cycle so key-image checks and the append see the same chain
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);

        let released = self.mixnet.take_released();
        let mut report = DrainReport::default();
        if released.is_empty() {
            return Ok(report);
        }

        let now = self.clock.now_millis();
        let mut seen = BTreeSet::new();
        let mut accepted = Vec::with_capacity(released.len());
        for ballot in released {
            match self.check_ballot(&ballot, &ledger, &seen, now) {
                Ok(()) => {
                    seen.insert(ballot.key_image());
                    accepted.push(ballot);
                }
                Err(reason) => {
                    warn!("{}: rejected ballot {}: {}", self.id, ballot.key_image_hex(), reason);
                    report.rejected.push(RejectedBallot {
                        key_image: ballot.key_image_hex(),
                        reason,
                    });
                }
            }
        }

        if accepted.is_empty() {
            return Ok(report);
        }

        report.accepted = accepted.len();
        let block = ledger.next_block(accepted, now, signing_key)?;
        let (index, hash) = (block.index, block.hash_hex());
        ledger.append(block, &self.params)?;

        info!(
            "{}: committed block {} with {} ballots ({})",
            self.id, index, report.accepted, hash
        );
        report.block = Some((index, hash));
        Ok(report)
    }

    fn check_ballot(
        &self,
        ballot: &Ballot,
        ledger: &Ledger,
        seen: &BTreeSet<[u8; 32]>,
        now: u64,
    ) -> Result<()> {
        ballot.verify(&self.params)?;
        ballot.check_freshness(now, self.config.max_ballot_age_ms, self.config.max_clock_skew_ms)?;

        let key_image = ballot.key_image();
        if ledger.contains_key_image(&key_image) || seen.contains(&key_image) {
            return Err(Error::DuplicateVote(ballot.key_image_hex()));
        }
        Ok(())
    }

    /// One sync cycle: adopt the longest valid peer chain if it is strictly longer than ours.
    ///
    /// Two different valid chains at the best height are a `ConsensusConflict`; nothing is
    /// adopted and the operator has to step in. Returns `Ok(None)` when skipped.
    pub fn sync(&self) -> Result<Option<SyncOutcome>> {
        let _guard = match InFlight::enter(&self.syncing) {
            Some(guard) => guard,
            None => {
                debug!("{}: sync tick skipped, previous cycle still running", self.id);
                return Ok(None);
            }
        };
        if self.is_closed() {
            return Ok(Some(SyncOutcome::Unchanged));
        }

        let (local_height, local_tip) = {
            let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
            (ledger.height(), ledger.tip().hash)
        };

        let peers: Vec<Arc<dyn Peer>> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Valid peer chains that are at least as long as ours and differ from it
        let mut candidates: Vec<(String, Ledger)> = Vec::new();
        for peer in peers {
            let blocks = match peer.chain() {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!("{}: could not fetch chain from {}: {}", self.id, peer.id(), e);
                    continue;
                }
            };
            if blocks.len() < local_height {
                continue;
            }
            if blocks.len() == local_height && blocks.last().map(|b| b.hash) == Some(local_tip) {
                continue;
            }
            match Ledger::from_blocks(blocks, &self.params) {
                Ok(ledger) => candidates.push((peer.id(), ledger)),
                Err(e) => warn!("{}: ignoring invalid chain from {}: {}", self.id, peer.id(), e),
            }
        }

        let best_height = match candidates.iter().map(|(_, l)| l.height()).max() {
            Some(height) => height,
            None => return Ok(Some(SyncOutcome::Unchanged)),
        };

        let mut tips: Vec<String> = Vec::new();
        let mut chosen: Option<(String, Ledger)> = None;
        for (peer, ledger) in candidates {
            if ledger.height() != best_height {
                continue;
            }
            let tip = ledger.tip().hash_hex();
            if !tips.contains(&tip) {
                tips.push(tip);
            }
            if chosen.is_none() {
                chosen = Some((peer, ledger));
            }
        }

        if best_height == local_height {
            tips.insert(0, hex::encode(local_tip));
        }
        if tips.len() > 1 {
            error!(
                "{}: consensus conflict at height {}: {:?}",
                self.id, best_height, tips
            );
            return Err(Error::ConsensusConflict {
                height: best_height,
                tips,
            });
        }

        let (peer, adopted) = match chosen {
            Some(chosen) => chosen,
            None => return Ok(Some(SyncOutcome::Unchanged)),
        };

        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        // A drain may have grown the local chain while we were validating
        if self.is_closed() || adopted.height() <= ledger.height() {
            return Ok(Some(SyncOutcome::Unchanged));
        }
        let height = adopted.height();
        *ledger = adopted;
        info!("{}: adopted chain of height {} from {}", self.id, height, peer);

        Ok(Some(SyncOutcome::Adopted { peer, height }))
    }

    /// Start the periodic cycles: drain (authority only) and sync. Both stop when `shutdown`
    /// flips to true; a cycle already running finishes first.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.is_authority() {
            let node = Arc::clone(self);
            handles.push(spawn_cycle(
                "drain",
                self.config.drain_interval(),
                shutdown.clone(),
                move || match node.drain() {
                    Ok(Some(report)) if !report.rejected.is_empty() => {
                        warn!("{}: drain rejected {} ballots", node.id, report.rejected.len())
                    }
                    Ok(_) => {}
                    Err(e) => error!("{}: drain failed: {}", node.id, e),
                },
            ));
        }

        let node = Arc::clone(self);
        handles.push(spawn_cycle(
            "sync",
            self.config.sync_interval(),
            shutdown,
            move || {
                if let Err(e) = node.sync() {
                    error!("{}: sync failed: {}", node.id, e);
                }
            },
        ));
        handles
    }
}

impl Peer for AuthorityNode {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn chain(&self) -> Result<Vec<Block>> {
        Ok(self.blocks())
    }
}

// Runs `cycle` on the blocking pool every `period`. A tick is skipped while the previous run
// is still going.
fn spawn_cycle<F>(
    name: &'static str,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let cycle = Arc::new(cycle);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if running.as_ref().map_or(false, |h| !h.is_finished()) {
                        debug!("{} tick skipped", name);
                        continue;
                    }
                    let cycle = Arc::clone(&cycle);
                    running = Some(tokio::task::spawn_blocking(move || cycle()));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = running {
            if let Err(e) = handle.await {
                error!("{} cycle panicked: {}", name, e);
            }
        }
        debug!("{} loop stopped", name);
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::Fixture;

    struct StaticPeer {
        id: &'static str,
        blocks: Vec<Block>,
    }

    impl Peer for StaticPeer {
        fn id(&self) -> String {
            self.id.to_owned()
        }

        fn chain(&self) -> Result<Vec<Block>> {
            Ok(self.blocks.clone())
        }
    }

    fn node(fixture: &Fixture, id: &str, authority: bool) -> (Arc<AuthorityNode>, Arc<Mixnet>) {
        let config = MixnetConfig {
            min_batch_size: 2,
            max_wait_ms: 1_000,
            tick_interval_ms: 10,
        };
        let mixnet = Arc::new(Mixnet::new(config, Arc::new(fixture.clock.clone())));
        let role = if authority {
            NodeRole::Authority(fixture.block_key.clone())
        } else {
            NodeRole::Replica
        };
        let node = AuthorityNode::new(
            id,
            role,
            Arc::new(fixture.params.clone()),
            SchedulerConfig::default(),
            Arc::new(fixture.clock.clone()),
            mixnet.clone(),
        )
        .unwrap();
        (Arc::new(node), mixnet)
    }

    #[test]
    fn test_drain_builds_one_block_per_cycle() {
        let mut fixture = Fixture::new(2, 5);
        let (node, mixnet) = node(&fixture, "authority", true);

        let report = node.drain().unwrap().unwrap();
        assert!(report.block.is_none());
        assert_eq!(node.height(), 1);

        mixnet.add_entry(fixture.cast(0, 0));
        mixnet.add_entry(fixture.cast(1, 1));
        mixnet.add_entry(fixture.cast(2, 1));
        mixnet.add_entry(fixture.cast(3, 0));
        assert_eq!(mixnet.released_len(), 4);

        let report = node.drain().unwrap().unwrap();
        assert_eq!(report.accepted, 4);
        assert!(report.rejected.is_empty());
        assert_eq!(report.block.as_ref().map(|b| b.0), Some(1));
        assert_eq!(node.height(), 2);
        assert_eq!(mixnet.released_len(), 0);

        let blocks = node.blocks();
        assert_eq!(blocks[1].previous_hash, blocks[0].hash);
        assert_eq!(blocks[1].ballots.len(), 4);
    }

    #[test]
    fn test_drain_rejects_without_aborting() {
        let mut fixture = Fixture::new(2, 5);
        let (node, mixnet) = node(&fixture, "authority", true);

        mixnet.add_entry(fixture.cast(0, 0));
        mixnet.add_entry(fixture.cast(1, 0));
        node.drain().unwrap();

        // Voter 0 again in a later batch, plus a tampered ballot and a good one
        let mut tampered = fixture.cast(2, 1);
        tampered.candidate_vector.reverse();
        mixnet.add_entry(fixture.cast(0, 1));
        mixnet.add_entry(tampered);
        mixnet.add_entry(fixture.cast(3, 1));
        mixnet.tick();
        fixture.clock.advance(1_001);
        mixnet.tick();

        let report = node.drain().unwrap().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(report
            .rejected
            .iter()
            .any(|r| matches!(r.reason, Error::DuplicateVote(_))));
        assert!(report.rejected.iter().any(|r| matches!(
            r.reason,
            Error::Validation(ValidationError::CommitmentMismatch)
        )));
        assert_eq!(node.height(), 3);
        assert_eq!(mixnet.released_len(), 0);
    }

    #[test]
    fn test_duplicates_within_one_cycle() {
        let mut fixture = Fixture::new(2, 5);
        let (node, mixnet) = node(&fixture, "authority", true);

        // Two separate releases of the same voter reach the same drain cycle
        mixnet.add_entry(fixture.cast(4, 0));
        mixnet.add_entry(fixture.cast(1, 0));
        mixnet.add_entry(fixture.cast(4, 1));
        mixnet.add_entry(fixture.cast(2, 0));
        assert_eq!(mixnet.released_len(), 4);

        let report = node.drain().unwrap().unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(node.blocks()[1].ballots.len(), 3);
    }

    #[test]
    fn test_stale_ballot_rejected() {
        let mut fixture = Fixture::new(2, 3);
        let (node, mixnet) = node(&fixture, "authority", true);

        mixnet.add_entry(fixture.cast(0, 0));
        mixnet.add_entry(fixture.cast(1, 0));
        fixture.clock.advance(SchedulerConfig::default().max_ballot_age_ms + 1);

        let report = node.drain().unwrap().unwrap();
        assert_eq!(report.accepted, 0);
        assert!(report.block.is_none());
        assert!(report.rejected.iter().all(|r| matches!(
            r.reason,
            Error::Validation(ValidationError::StaleBallot { .. })
        )));
        assert_eq!(node.height(), 1);
    }

    #[test]
    fn test_replica_cannot_drain() {
        let fixture = Fixture::new(2, 3);
        let (replica, _) = node(&fixture, "replica", false);
        assert!(matches!(replica.drain(), Err(Error::NotAuthority)));
    }

    #[test]
    fn test_authority_key_must_match() {
        let fixture = Fixture::new(2, 3);
        let (imposter, _) = generate_keypair();
        let mixnet = Arc::new(Mixnet::new(MixnetConfig::default(), Arc::new(SystemClock)));
        let result = AuthorityNode::new(
            "imposter",
            NodeRole::Authority(imposter),
            Arc::new(fixture.params.clone()),
            SchedulerConfig::default(),
            Arc::new(SystemClock),
            mixnet,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_in_flight_guard() {
        let fixture = Fixture::new(2, 3);
        let (node, _) = node(&fixture, "authority", true);

        let held = InFlight::enter(&node.draining).unwrap();
        assert!(node.drain().unwrap().is_none());
        drop(held);
        assert!(node.drain().unwrap().is_some());

        let held = InFlight::enter(&node.syncing).unwrap();
        assert!(node.sync().unwrap().is_none());
        drop(held);
        assert_eq!(node.sync().unwrap(), Some(SyncOutcome::Unchanged));
    }

    #[test]
    fn test_sync_adopts_longer_chain() {
        let mut fixture = Fixture::new(2, 4);
        let (authority, mixnet) = node(&fixture, "authority", true);
        let (replica, _) = node(&fixture, "replica", false);
        replica.add_peer(authority.clone());

        mixnet.add_entry(fixture.cast(0, 1));
        mixnet.add_entry(fixture.cast(1, 0));
        authority.drain().unwrap();
        mixnet.add_entry(fixture.cast(2, 1));
        mixnet.add_entry(fixture.cast(3, 1));
        authority.drain().unwrap();
        assert_eq!(authority.height(), 3);

        assert_eq!(
            replica.sync().unwrap(),
            Some(SyncOutcome::Adopted {
                peer: "authority".to_owned(),
                height: 3
            })
        );
        assert_eq!(replica.blocks(), authority.blocks());
        assert!(replica.contains_key_image(&fixture.cast(2, 0).key_image()));

        // Nothing new
        assert_eq!(replica.sync().unwrap(), Some(SyncOutcome::Unchanged));
    }

    #[test]
    fn test_sync_ignores_invalid_and_shorter_chains() {
        let mut fixture = Fixture::new(2, 4);
        let (authority, mixnet) = node(&fixture, "authority", true);
        mixnet.add_entry(fixture.cast(0, 1));
        mixnet.add_entry(fixture.cast(1, 0));
        authority.drain().unwrap();

        let mut tampered = authority.blocks();
        tampered[1].ballots.pop();
        let (replica, _) = node(&fixture, "replica", false);
        replica.add_peer(Arc::new(StaticPeer {
            id: "liar",
            blocks: tampered,
        }));
        replica.add_peer(Arc::new(StaticPeer {
            id: "behind",
            blocks: authority.blocks()[..1].to_vec(),
        }));
        assert_eq!(replica.sync().unwrap(), Some(SyncOutcome::Unchanged));
        assert_eq!(replica.height(), 1);
    }

    #[test]
    fn test_sync_equal_length_fork_is_conflict() {
        let mut fixture = Fixture::new(2, 4);
        let (a, mixnet_a) = node(&fixture, "a", true);
        let (b, mixnet_b) = node(&fixture, "b", true);

        mixnet_a.add_entry(fixture.cast(0, 1));
        mixnet_a.add_entry(fixture.cast(1, 0));
        a.drain().unwrap();
        mixnet_b.add_entry(fixture.cast(2, 1));
        mixnet_b.add_entry(fixture.cast(3, 0));
        b.drain().unwrap();

        a.add_peer(b.clone());
        match a.sync() {
            Err(Error::ConsensusConflict { height: 2, tips }) => assert_eq!(tips.len(), 2),
            other => panic!("expected consensus conflict, got {:?}", other),
        }
        // Nothing was picked
        assert_eq!(a.blocks()[1].ballots.len(), 2);
        assert_ne!(a.blocks(), b.blocks());

        // Two competing longer chains are just as unresolvable
        let (replica, _) = node(&fixture, "replica", false);
        replica.add_peer(a.clone());
        replica.add_peer(b.clone());
        assert!(matches!(
            replica.sync(),
            Err(Error::ConsensusConflict { height: 2, .. })
        ));
        assert_eq!(replica.height(), 1);
    }

    #[test]
    fn test_close_commits_partial_batch_and_freezes() {
        let mut fixture = Fixture::new(2, 4);
        let (node, mixnet) = node(&fixture, "authority", true);
        let (replica, _) = self::node(&fixture, "replica", false);
        replica.add_peer(node.clone());

        // Below min_batch_size and nowhere near max_wait
        mixnet.add_entry(fixture.cast(0, 1));
        assert_eq!(mixnet.pending_len(), 1);

        let report = node.close().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.block.as_ref().map(|b| b.0), Some(1));
        assert!(node.is_closed());
        assert_eq!(mixnet.pending_len(), 0);

        // Later arrivals never reach the chain
        mixnet.add_entry(fixture.cast(1, 0));
        mixnet.add_entry(fixture.cast(2, 0));
        assert!(node.drain().unwrap().is_none());
        assert_eq!(node.height(), 2);
        assert_eq!(node.close().unwrap().accepted, 0);

        replica.close().unwrap();
        assert_eq!(replica.sync().unwrap(), Some(SyncOutcome::Unchanged));
        assert_eq!(replica.height(), 1);
    }

    #[test]
    fn test_close_waits_for_running_drain() {
        let mut fixture = Fixture::new(2, 3);
        let (node, mixnet) = node(&fixture, "authority", true);
        mixnet.add_entry(fixture.cast(0, 0));

        let held = InFlight::enter(&node.draining).unwrap();
        let closer = {
            let node = Arc::clone(&node);
            std::thread::spawn(move || node.close())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!node.is_closed());
        drop(held);

        let report = closer.join().unwrap().unwrap();
        assert_eq!(report.accepted, 1);
        assert!(node.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_cycle_skips_ticks_while_running() {
        use std::sync::atomic::AtomicUsize;

        let active = Arc::new(AtomicUsize::new(0));
        let most_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (stop, shutdown) = watch::channel(false);
        let handle = {
            let (active, most_active, runs) =
                (Arc::clone(&active), Arc::clone(&most_active), Arc::clone(&runs));
            spawn_cycle("slow", std::time::Duration::from_millis(10), shutdown, move || {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                most_active.fetch_max(now_active, Ordering::SeqCst);
                // Five periods per run
                std::thread::sleep(std::time::Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        let runs = runs.load(Ordering::SeqCst);
        assert_eq!(most_active.load(Ordering::SeqCst), 1);
        assert!(runs >= 2, "only {} runs", runs);
        // 30 ticks elapsed; overlapping or queued ticks would show up here
        assert!(runs <= 8, "{} runs for 30 ticks", runs);
        // Shutdown waits for the run in progress
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduler_loops() {
        let mut fixture = Fixture::new(2, 4);
        let config = SchedulerConfig {
            drain_interval_ms: 20,
            sync_interval_ms: 20,
            ..SchedulerConfig::default()
        };
        let mixnet = Arc::new(Mixnet::new(
            MixnetConfig {
                min_batch_size: 2,
                max_wait_ms: 1_000,
                tick_interval_ms: 10,
            },
            Arc::new(fixture.clock.clone()),
        ));
        let params = Arc::new(fixture.params.clone());
        let authority = Arc::new(
            AuthorityNode::new(
                "authority",
                NodeRole::Authority(fixture.block_key.clone()),
                params.clone(),
                config.clone(),
                Arc::new(fixture.clock.clone()),
                mixnet.clone(),
            )
            .unwrap(),
        );
        let replica = Arc::new(
            AuthorityNode::new(
                "replica",
                NodeRole::Replica,
                params,
                config,
                Arc::new(fixture.clock.clone()),
                Arc::new(Mixnet::new(MixnetConfig::default(), Arc::new(fixture.clock.clone()))),
            )
            .unwrap(),
        );
        replica.add_peer(authority.clone());

        let (stop, shutdown) = watch::channel(false);
        let mut handles = authority.spawn(shutdown.clone());
        handles.extend(replica.spawn(shutdown));
        assert_eq!(handles.len(), 3);

        mixnet.add_entry(fixture.cast(0, 0));
        mixnet.add_entry(fixture.cast(1, 1));

        let mut waited = 0;
        while replica.height() < 2 && waited < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            waited += 1;
        }
        assert_eq!(authority.height(), 2);
        assert_eq!(replica.blocks(), authority.blocks());

        stop.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
