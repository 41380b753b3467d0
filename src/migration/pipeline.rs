//! Concurrent re-keying of every entry under a namespace.
//!
//! One producer (the calling thread) feeds keys into a bounded job queue, a
//! fixed pool of workers performs the get/put/delete for each key, and every
//! completed swap goes through a second bounded queue to a single writer that
//! owns the [`BackupWriter`]. The writer is joined and the log fsynced before
//! [`KeySwapper::run`] returns, so a caller that advances the version marker
//! afterwards never gets ahead of the log.

use std::collections::HashSet;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::config::Tuning;
use crate::error::{KeyOp, MigrationError, StoreError};
use crate::logger::Logger;
use crate::migration::backup::{BackupWriter, Swap};
use crate::store::{Datastore, Key};

/// Outcome of replaying a backup log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub restored: usize,
    pub already_reverted: usize,
}

pub struct KeySwapper<'a> {
    store: &'a dyn Datastore,
    tuning: Tuning,
    log: Logger,
}

impl<'a> KeySwapper<'a> {
    pub fn new(store: &'a dyn Datastore, tuning: Tuning, log: &Logger) -> Self {
        Self {
            store,
            tuning,
            log: log.clone(),
        }
    }

    /// Moves every key under `prefix` to `map(key)`, logging each swap to
    /// `backup`. Keys that map to themselves are left in place. Returns the
    /// number of records written.
    ///
    /// A target that was already listed under `prefix` when the run started is
    /// not overwritten: its value must match the source's, the source is
    /// dropped, and the record is marked `kept`.
    ///
    /// The first per-key failure cancels the run. Swaps already performed stay
    /// in the store and are still flushed to the log before the error is
    /// returned.
    pub fn run<F>(&self, prefix: &str, map: F, backup: BackupWriter) -> Result<usize, MigrationError>
    where
        F: Fn(&Key) -> Result<Key, MigrationError> + Sync,
    {
        let keys = self
            .store
            .query(prefix)
            .map_err(|e| MigrationError::transform(&Key::new(prefix), KeyOp::Query, e))?;
        self.log
            .vlog(&format!("found {} key(s) under {prefix}", keys.len()));
        let present: HashSet<Key> = keys.iter().cloned().collect();

        let (record_tx, record_rx) = sync_channel::<Swap>(self.tuning.queue_capacity);
        thread::scope(|scope| {
            let writer = scope.spawn(move || -> Result<usize, MigrationError> {
                let mut backup = backup;
                for swap in record_rx {
                    backup.write_record(&swap)?;
                }
                backup.finish()
            });

            let swapped = self.fan_out(
                keys.into_iter().map(Ok),
                |key| self.swap(key, &map, &present),
                Some(record_tx),
            );

            let written = match writer.join() {
                Ok(written) => written,
                Err(panic) => resume_unwind(panic),
            };
            // A failed writer explains any send errors the workers saw.
            let written = written?;
            swapped?;
            Ok(written)
        })
    }

    /// First half of a revert: `get` at the new key and `put` at the old key
    /// for every record. New keys are left alone so that several records
    /// sharing one new key can all be restored. A record whose new key is gone
    /// while its old key exists was already reverted and is skipped.
    pub fn restore<I>(&self, records: I) -> Result<ReplayStats, MigrationError>
    where
        I: Iterator<Item = Result<Swap, MigrationError>>,
    {
        let restored = AtomicUsize::new(0);
        let already_reverted = AtomicUsize::new(0);
        self.fan_out(
            records,
            |swap| {
                if self.restore_one(&swap)? {
                    restored.fetch_add(1, Ordering::Relaxed);
                } else {
                    already_reverted.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None)
            },
            None,
        )?;
        Ok(ReplayStats {
            restored: restored.into_inner(),
            already_reverted: already_reverted.into_inner(),
        })
    }

    /// Second half of a revert, run once [`restore`](Self::restore) has been
    /// through the whole log: deletes the new key of every record not marked
    /// `kept`. A key named by several records is deleted once; the repeats
    /// find it absent, which `delete` accepts.
    pub fn remove_targets<I>(&self, records: I) -> Result<(), MigrationError>
    where
        I: Iterator<Item = Result<Swap, MigrationError>>,
    {
        self.fan_out(
            records,
            |swap| {
                if !swap.kept {
                    self.store
                        .delete(&swap.new)
                        .map_err(|e| MigrationError::transform(&swap.new, KeyOp::Delete, e))?;
                    self.log.vlog(&format!("removed {}", swap.new));
                }
                Ok(None)
            },
            None,
        )
    }

    fn swap<F>(
        &self,
        old: Key,
        map: &F,
        present: &HashSet<Key>,
    ) -> Result<Option<Swap>, MigrationError>
    where
        F: Fn(&Key) -> Result<Key, MigrationError>,
    {
        let new = map(&old)?;
        if new == old {
            return Ok(None);
        }
        let value = self
            .store
            .get(&old)
            .map_err(|e| MigrationError::transform(&old, KeyOp::Get, e))?;
        let kept = present.contains(&new);
        if kept {
            let existing = self
                .store
                .get(&new)
                .map_err(|e| MigrationError::transform(&new, KeyOp::Get, e))?;
            if existing != value {
                return Err(MigrationError::Conflict { old, new });
            }
        } else {
            self.store
                .put(&new, &value)
                .map_err(|e| MigrationError::transform(&new, KeyOp::Put, e))?;
        }
        self.store
            .delete(&old)
            .map_err(|e| MigrationError::transform(&old, KeyOp::Delete, e))?;
        self.log.vlog(&format!("swapped {old} -> {new}"));
        Ok(Some(Swap { old, new, kept }))
    }

    fn restore_one(&self, swap: &Swap) -> Result<bool, MigrationError> {
        let value = match self.store.get(&swap.new) {
            Ok(value) => value,
            Err(StoreError::NotFound(_)) => {
                let has_old = self
                    .store
                    .has(&swap.old)
                    .map_err(|e| MigrationError::transform(&swap.old, KeyOp::Get, e))?;
                if has_old {
                    self.log
                        .warn(&format!("{} already restored, skipping", swap.old));
                    return Ok(false);
                }
                return Err(MigrationError::transform(
                    &swap.new,
                    KeyOp::Get,
                    StoreError::NotFound(swap.new.clone()),
                ));
            }
            Err(e) => return Err(MigrationError::transform(&swap.new, KeyOp::Get, e)),
        };
        self.store
            .put(&swap.old, &value)
            .map_err(|e| MigrationError::transform(&swap.old, KeyOp::Put, e))?;
        self.log.vlog(&format!("restored {} <- {}", swap.old, swap.new));
        Ok(true)
    }

    /// Runs `work` over `source` on the worker pool. Results that carry a swap
    /// are forwarded to `records`. Returns the first error any stage hit.
    fn fan_out<T, S, W>(
        &self,
        source: S,
        work: W,
        records: Option<SyncSender<Swap>>,
    ) -> Result<(), MigrationError>
    where
        T: Send,
        S: Iterator<Item = Result<T, MigrationError>>,
        W: Fn(T) -> Result<Option<Swap>, MigrationError> + Sync,
    {
        let workers = self.tuning.workers.max(1);
        let (job_tx, job_rx) = sync_channel::<T>(workers * 2);
        let job_rx = Mutex::new(job_rx);
        let cancelled = AtomicBool::new(false);
        let first_error: Mutex<Option<MigrationError>> = Mutex::new(None);

        let fail = |err: MigrationError| {
            let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                self.log.error(&format!("aborting: {err}"));
                *slot = Some(err);
            }
            cancelled.store(true, Ordering::SeqCst);
        };

        let senders: Vec<Option<SyncSender<Swap>>> =
            (0..workers).map(|_| records.clone()).collect();
        drop(records);

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for records in senders {
                let (job_rx, work, fail, cancelled) = (&job_rx, &work, &fail, &cancelled);
                handles.push(scope.spawn(move || {
                    loop {
                        let job = job_rx
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .recv();
                        let Ok(job) = job else { break };
                        // Keep draining after a failure so the producer never
                        // blocks on a full queue.
                        if cancelled.load(Ordering::SeqCst) {
                            continue;
                        }
                        match work(job) {
                            Ok(Some(swap)) => {
                                if let Some(tx) = &records
                                    && tx.send(swap).is_err()
                                {
                                    cancelled.store(true, Ordering::SeqCst);
                                }
                            }
                            Ok(None) => {}
                            Err(err) => fail(err),
                        }
                    }
                }));
            }

            for item in source {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                match item {
                    Ok(job) => {
                        if job_tx.send(job).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        fail(err);
                        break;
                    }
                }
            }
            drop(job_tx);

            for handle in handles {
                if let Err(panic) = handle.join() {
                    resume_unwind(panic);
                }
            }
        });

        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
