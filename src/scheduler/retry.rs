//! Optimistic-concurrency retry loop.
//!
//! Agent records are never locked. A writer reads the record, derives an
//! updated copy and writes it back with compare-and-swap on
//! `update_index`; if another writer got there first the record is read
//! again and the whole derivation is redone. The loop is unbounded: under
//! single-writer-wins one of the contenders always makes progress, so a
//! conflict streak only lasts while other writers keep succeeding.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::Result;

/// Conflicts answered with a plain yield before sleeping.
const YIELD_ROUNDS: u32 = 3;

/// Backoff added per conflict past [`YIELD_ROUNDS`].
const BACKOFF_STEP: Duration = Duration::from_millis(5);

/// Longest pause between two attempts.
const BACKOFF_CAP: Duration = Duration::from_millis(100);

/// What one derivation step decided.
#[derive(Debug)]
pub enum Mutation<T, X> {
    /// Nothing to persist; `T` is the final state.
    Keep(T, X),
    /// Persist `T` with compare-and-swap, then finish.
    Write(T, X),
}

/// Pause taken after the `conflicts`-th consecutive conflict, or `None`
/// when a yield is enough.
#[must_use]
pub fn backoff_delay(conflicts: u32) -> Option<Duration> {
    if conflicts <= YIELD_ROUNDS {
        return None;
    }
    Some((BACKOFF_STEP * (conflicts - YIELD_ROUNDS)).min(BACKOFF_CAP))
}

/// Derive and write a record until the compare-and-swap succeeds.
///
/// `mutate` gets the latest known state and either keeps it or returns an
/// updated copy plus an extra value handed back to the caller; `write`
/// persists the copy and returns the stored record, or `None` if the
/// record changed underneath. On a conflict `fetch` re-reads the record and
/// `mutate` runs again, so side effects in `mutate` must be safe to repeat.
///
/// # Errors
///
/// Returns the first error produced by `fetch`, `mutate` or `write`.
pub async fn update_with_retry<T, X, F, FFut, M, MFut, W, WFut>(
    what: &str,
    initial: T,
    mut fetch: F,
    mut mutate: M,
    mut write: W,
) -> Result<(T, X)>
where
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<T>>,
    M: FnMut(T) -> MFut,
    MFut: Future<Output = Result<Mutation<T, X>>>,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<Option<T>>>,
{
    let mut current = initial;
    let mut conflicts: u32 = 0;

    loop {
        let (updated, extra) = match mutate(current).await? {
            Mutation::Keep(unchanged, extra) => return Ok((unchanged, extra)),
            Mutation::Write(updated, extra) => (updated, extra),
        };

        if let Some(stored) = write(updated).await? {
            return Ok((stored, extra));
        }

        conflicts = conflicts.saturating_add(1);
        debug!(what, conflicts, "compare-and-swap conflict, retrying");
        match backoff_delay(conflicts) {
            None => tokio::task::yield_now().await,
            Some(delay) => tokio::time::sleep(delay).await,
        }

        current = fetch().await?;
    }
}
