//! Batching and shuffling of accepted ballots, so the order ballots reach the ledger says
//! nothing about the order they were cast in.

use crate::*;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct PendingEntry {
    ballot: Ballot,
    arrived_at: u64,
}

/// How a batch came to be released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The buffer reached `min_batch_size`
    Full(usize),

    /// The oldest entry waited longer than `max_wait_ms`
    Forced(usize),
}

pub struct Mixnet {
    config: MixnetConfig,
    clock: Arc<dyn Clock>,

    // Lock order: pending, then released
    pending: Mutex<Vec<PendingEntry>>,
    released: Mutex<VecDeque<Ballot>>,
}

impl Mixnet {
    pub fn new(config: MixnetConfig, clock: Arc<dyn Clock>) -> Self {
        Mixnet {
            config,
            clock,
            pending: Mutex::new(Vec::new()),
            released: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &MixnetConfig {
        &self.config
    }

    /// Buffer a ballot. Releases the buffer if it is now full.
    ///
    /// Returns false, and buffers nothing, if a ballot with the same key image is already waiting.
    pub fn add_entry(&self, ballot: Ballot) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let key_image = ballot.key_image();
        if pending.iter().any(|e| e.ballot.key_image() == key_image) {
            warn!("mixnet refused ballot {}: key image already buffered", hex::encode(key_image));
            return false;
        }

        pending.push(PendingEntry {
            ballot,
            arrived_at: self.clock.now_millis(),
        });

        if pending.len() >= self.config.min_batch_size {
            self.release(&mut pending, false);
        }
        true
    }

    /// Periodic check: release a full buffer, or force out a partial one that waited too long.
    pub fn tick(&self) -> Option<Release> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() {
            return None;
        }

        if pending.len() >= self.config.min_batch_size {
            return Some(self.release(&mut pending, false));
        }

        let now = self.clock.now_millis();
        let oldest = pending.iter().map(|e| e.arrived_at).min().unwrap_or(now);
        if now.saturating_sub(oldest) > self.config.max_wait_ms {
            return Some(self.release(&mut pending, true));
        }

        None
    }

    /// Release whatever is buffered, however small, e.g. when voting closes.
    pub fn flush(&self) -> Option<Release> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() {
            return None;
        }
        Some(self.release(&mut pending, true))
    }

    // Called with the pending lock held, so a release and an add never interleave.
    fn release(&self, pending: &mut Vec<PendingEntry>, forced: bool) -> Release {
        let mut batch: Vec<Ballot> = std::mem::take(pending)
            .into_iter()
            .map(|entry| entry.ballot)
            .collect();

        // Fisher-Yates
        batch.shuffle(&mut rand::thread_rng());

        let size = batch.len();
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch);

        info!("mixnet released a batch of {} ballots (forced: {})", size, forced);
        if forced {
            Release::Forced(size)
        } else {
            Release::Full(size)
        }
    }

    /// Hand every released ballot to the caller, in release order
    pub fn take_released(&self) -> Vec<Ballot> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn released_len(&self) -> usize {
        self.released.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a ballot with this key image is buffered or released but not yet drained
    pub fn contains_key_image(&self, key_image: &[u8; 32]) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.iter().any(|e| &e.ballot.key_image() == key_image) {
            return true;
        }
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|b| &b.key_image() == key_image)
    }

    /// Run `tick` every `tick_interval_ms` until `shutdown` flips to true.
    pub fn spawn_ticker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mixnet = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(mixnet.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(release) = mixnet.tick() {
                            debug!("mixnet tick: {:?}", release);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("mixnet ticker stopped");
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::Fixture;

    fn mixnet(min_batch_size: usize, max_wait_ms: u64, clock: &ManualClock) -> Mixnet {
        let config = MixnetConfig {
            min_batch_size,
            max_wait_ms,
            tick_interval_ms: 10,
        };
        Mixnet::new(config, Arc::new(clock.clone()))
    }

    fn key_images(ballots: &[Ballot]) -> Vec<[u8; 32]> {
        ballots.iter().map(|b| b.key_image()).collect()
    }

    #[test]
    fn test_release_when_full() {
        let mut fixture = Fixture::new(2, 6);
        let clock = ManualClock::new(0);
        let mixnet = mixnet(3, 1_000, &clock);
        let ballots: Vec<Ballot> = (0..5).map(|v| fixture.cast(v, v % 2)).collect();

        assert!(mixnet.add_entry(ballots[0].clone()));
        assert!(mixnet.add_entry(ballots[1].clone()));
        assert_eq!(mixnet.released_len(), 0);
        assert_eq!(mixnet.tick(), None);

        assert!(mixnet.add_entry(ballots[2].clone()));
        assert_eq!(mixnet.pending_len(), 0);
        assert_eq!(mixnet.released_len(), 3);

        // Added after the release, so part of the next batch
        assert!(mixnet.add_entry(ballots[3].clone()));
        assert_eq!(mixnet.pending_len(), 1);

        let mut out = key_images(&mixnet.take_released());
        let mut expected = key_images(&ballots[..3]);
        out.sort();
        expected.sort();
        assert_eq!(out, expected);
        assert_eq!(mixnet.released_len(), 0);
    }

    #[test]
    fn test_forced_release() {
        let mut fixture = Fixture::new(2, 3);
        let clock = ManualClock::new(5_000);
        let mixnet = mixnet(10, 1_000, &clock);

        mixnet.add_entry(fixture.cast(0, 0));
        clock.advance(600);
        mixnet.add_entry(fixture.cast(1, 1));

        clock.advance(400);
        assert_eq!(mixnet.tick(), None);

        // The oldest entry is now past max_wait
        clock.advance(1);
        assert_eq!(mixnet.tick(), Some(Release::Forced(2)));
        assert_eq!(mixnet.take_released().len(), 2);
        assert_eq!(mixnet.tick(), None);
    }

    #[test]
    fn test_duplicate_key_image_refused() {
        let mut fixture = Fixture::new(2, 3);
        let clock = ManualClock::new(0);
        let mixnet = mixnet(5, 1_000, &clock);

        let first = fixture.cast(2, 0);
        let again = fixture.cast(2, 1);
        assert!(mixnet.add_entry(first.clone()));
        assert!(!mixnet.add_entry(again));
        assert_eq!(mixnet.pending_len(), 1);
        assert!(mixnet.contains_key_image(&first.key_image()));
    }

    #[test]
    fn test_shuffle_preserves_multiset_and_reorders() {
        let mut fixture = Fixture::new(2, 6);
        let ballots: Vec<Ballot> = (0..6).map(|v| fixture.cast(v, 0)).collect();
        let arrival = key_images(&ballots);

        let mut reordered = 0;
        for _ in 0..20 {
            let clock = ManualClock::new(0);
            let mixnet = mixnet(6, 1_000, &clock);
            for ballot in ballots.iter() {
                assert!(mixnet.add_entry(ballot.clone()));
            }
            let out = key_images(&mixnet.take_released());
            assert_eq!(out.len(), arrival.len());

            let mut sorted_out = out.clone();
            let mut sorted_in = arrival.clone();
            sorted_out.sort();
            sorted_in.sort();
            assert_eq!(sorted_out, sorted_in);

            if out != arrival {
                reordered += 1;
            }
        }

        // 1/720 chance per trial of the identity permutation
        assert!(reordered >= 15, "only {} of 20 batches were reordered", reordered);
    }

    #[test]
    fn test_flush_releases_partial_batch() {
        let mut fixture = Fixture::new(2, 3);
        let clock = ManualClock::new(0);
        let mixnet = mixnet(10, 60_000, &clock);
        assert_eq!(mixnet.flush(), None);

        let first = fixture.cast(0, 0);
        mixnet.add_entry(first.clone());
        mixnet.add_entry(fixture.cast(1, 1));
        assert_eq!(mixnet.tick(), None);
        assert_eq!(mixnet.flush(), Some(Release::Forced(2)));
        assert_eq!(mixnet.pending_len(), 0);

        // Released but not yet drained still counts as seen
        assert!(mixnet.contains_key_image(&first.key_image()));
        assert_eq!(mixnet.take_released().len(), 2);
        assert!(!mixnet.contains_key_image(&first.key_image()));
    }

    #[test]
    fn test_concurrent_add_and_tick_conserve_ballots() {
        let mut fixture = Fixture::new(2, 24);
        let clock = ManualClock::new(0);
        let mixnet = Arc::new(mixnet(5, 3, &clock));
        let ballots: Vec<Ballot> = (0..24).map(|v| fixture.cast(v, v % 2)).collect();
        let mut expected = key_images(&ballots);
        expected.sort();

        let adders: Vec<_> = ballots
            .chunks(6)
            .map(|chunk| {
                let mixnet = Arc::clone(&mixnet);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for ballot in chunk {
                        assert!(mixnet.add_entry(ballot));
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ticker = {
            let (mixnet, clock, done) = (Arc::clone(&mixnet), clock.clone(), Arc::clone(&done));
            std::thread::spawn(move || {
                let mut drained = Vec::new();
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    clock.advance(1);
                    mixnet.tick();
                    drained.extend(mixnet.take_released());
                    std::thread::yield_now();
                }
                drained
            })
        };

        for adder in adders {
            adder.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut drained = ticker.join().unwrap();

        mixnet.flush();
        drained.extend(mixnet.take_released());
        let mut out = key_images(&drained);
        out.sort();
        assert_eq!(out, expected);
        assert_eq!(mixnet.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_forces_release() {
        let mut fixture = Fixture::new(2, 3);
        let clock = ManualClock::new(0);
        let mixnet = Arc::new(mixnet(10, 50, &clock));
        let (stop, shutdown) = watch::channel(false);
        let handle = mixnet.spawn_ticker(shutdown);

        mixnet.add_entry(fixture.cast(0, 1));
        clock.advance(51);
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert_eq!(mixnet.released_len(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
