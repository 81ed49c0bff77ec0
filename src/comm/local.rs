//! In-process participant group
//!
//! Every participant is a thread of the current process. Collectives meet
//! at a shared barrier and move data through a `P x P` mailbox: slot
//! `(i, j)` holds what participant `i` sends to participant `j` during the
//! current exchange.
//!
//! A participant that returns an error or panics inside [`LocalGroup::run`]
//! aborts the group; peers blocked in a collective then fail with
//! `Communication` instead of waiting forever.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use super::Communicator;
use crate::error::{DistMemError, DistResult};
use crate::invalid_argument;

type Parcel = Option<Box<dyn Any + Send>>;

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

struct Shared {
    size: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    mailbox: Mutex<Vec<Parcel>>,
    gathered: Mutex<Vec<usize>>,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            mailbox: Mutex::new((0..size * size).map(|_| None).collect()),
            gathered: Mutex::new(vec![0; size]),
        }
    }

    /// Block until all participants arrive; `Ok(false)` if the group was
    /// aborted instead
    fn wait(&self) -> DistResult<bool> {
        let mut state = self.state.lock()?;
        if state.aborted {
            return Ok(false);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(true);
        }

        while state.generation == generation && !state.aborted {
            state = self.released.wait(state)?;
        }
        Ok(state.generation != generation)
    }

    fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.released.notify_all();
    }
}

/// One participant's endpoint of a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: usize,
    shared: Arc<Shared>,
    saw_abort: Cell<bool>,
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalCommunicator {
    /// Abort the group: peers blocked in or entering a collective fail
    pub fn abort(&self) {
        tracing::warn!("LocalGroup: rank {} aborted the group", self.rank);
        self.shared.abort();
    }

    fn sync(&self, op: &str) -> DistResult<()> {
        if self.shared.wait()? {
            return Ok(());
        }
        self.saw_abort.set(true);
        Err(DistMemError::Communication(format!(
            "participant group aborted while rank {} was in {}",
            self.rank, op
        )))
    }

    /// Abort on a local failure so no peer is left waiting
    fn fail(&self, err: DistMemError) -> DistMemError {
        self.shared.abort();
        err
    }
}

impl Communicator for LocalCommunicator {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) -> DistResult<()> {
        self.sync("barrier")
    }

    fn allgather(&self, value: usize) -> DistResult<Vec<usize>> {
        self.shared.gathered.lock()?[self.rank] = value;
        self.sync("allgather")?;
        let values = self.shared.gathered.lock()?.clone();
        // Slots are rewritten by the next allgather only after everyone has read
        self.sync("allgather")?;
        Ok(values)
    }

    fn alltoallv<T: Copy + Send + 'static>(
        &self,
        send: &[T],
        sendcounts: &[usize],
        sdispls: &[usize],
        recv: &mut [T],
        recvcounts: &[usize],
        rdispls: &[usize],
    ) -> DistResult<()> {
        let size = self.shared.size;
        check_layout(size, "send", send.len(), sendcounts, sdispls).map_err(|e| self.fail(e))?;
        check_layout(size, "receive", recv.len(), recvcounts, rdispls)
            .map_err(|e| self.fail(e))?;

        {
            let mut mailbox = self.shared.mailbox.lock()?;
            for peer in 0..size {
                let chunk = &send[sdispls[peer]..sdispls[peer] + sendcounts[peer]];
                mailbox[self.rank * size + peer] = Some(Box::new(chunk.to_vec()));
            }
        }
        self.sync("alltoallv")?;

        // Drain every slot addressed to us even after a mismatch, so the
        // mailbox is empty for the next exchange
        let mut mismatch = None;
        {
            let mut mailbox = self.shared.mailbox.lock()?;
            for peer in 0..size {
                let parcel = mailbox[peer * size + self.rank].take();
                let outcome = match parcel.map(|p| p.downcast::<Vec<T>>()) {
                    Some(Ok(chunk)) if chunk.len() == recvcounts[peer] => {
                        recv[rdispls[peer]..rdispls[peer] + chunk.len()].copy_from_slice(&chunk);
                        Ok(())
                    }
                    Some(Ok(chunk)) => Err(DistMemError::Communication(format!(
                        "rank {} expected {} elements from rank {}, got {}",
                        self.rank,
                        recvcounts[peer],
                        peer,
                        chunk.len()
                    ))),
                    Some(Err(_)) => Err(DistMemError::Communication(format!(
                        "rank {} received elements of a different type from rank {}",
                        self.rank, peer
                    ))),
                    None => Err(DistMemError::Communication(format!(
                        "rank {} found no message from rank {}",
                        self.rank, peer
                    ))),
                };
                if let Err(e) = outcome {
                    mismatch.get_or_insert(e);
                }
            }
        }
        self.sync("alltoallv")?;

        tracing::trace!(
            "LocalGroup: rank {} exchanged {} out / {} in elements",
            self.rank,
            sendcounts.iter().sum::<usize>(),
            recvcounts.iter().sum::<usize>()
        );

        match mismatch {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Check that `counts`/`displs` describe chunks inside a buffer of `len`
fn check_layout(
    size: usize,
    direction: &str,
    len: usize,
    counts: &[usize],
    displs: &[usize],
) -> DistResult<()> {
    if counts.len() != size || displs.len() != size {
        return Err(invalid_argument!(
            "{} counts/displacements have {}/{} entries for a group of {}",
            direction,
            counts.len(),
            displs.len(),
            size
        ));
    }
    for (peer, (&count, &displ)) in counts.iter().zip(displs).enumerate() {
        let end = displ.checked_add(count);
        if end.map_or(true, |end| end > len) {
            return Err(invalid_argument!(
                "{} chunk for rank {} ({} elements at {}) exceeds buffer of {}",
                direction,
                peer,
                count,
                displ,
                len
            ));
        }
    }
    Ok(())
}

/// Factory for in-process participant groups
#[derive(Debug, Clone, Copy)]
pub struct LocalGroup;

impl LocalGroup {
    /// Endpoints for `size` participants, in rank order
    ///
    /// Each endpoint must be driven by its own thread; collectives block
    /// until every participant has entered them.
    pub fn create(size: usize) -> DistResult<Vec<LocalCommunicator>> {
        if size == 0 {
            return Err(invalid_argument!("participant group needs at least one member"));
        }
        let shared = Arc::new(Shared::new(size));
        tracing::debug!("LocalGroup: created group of {} participants", size);

        Ok((0..size)
            .map(|rank| LocalCommunicator {
                rank,
                shared: Arc::clone(&shared),
                saw_abort: Cell::new(false),
            })
            .collect())
    }

    /// Run `f` once per participant, each on its own thread, and collect
    /// the results in rank order
    ///
    /// If any participant fails, the error of the participant that caused
    /// the failure is returned (a panic is reported as `Communication`).
    pub fn run<F, R>(size: usize, f: F) -> DistResult<Vec<R>>
    where
        F: Fn(&LocalCommunicator) -> DistResult<R> + Sync,
        R: Send,
    {
        let comms = Self::create(size)?;
        let f = &f;

        let outcomes: Vec<thread::Result<(DistResult<R>, bool)>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    thread::Builder::new()
                        .name(format!("distmem-rank-{}", comm.rank))
                        .spawn_scoped(scope, move || {
                            let _guard = AbortOnPanic(&comm.shared);
                            let result = f(&comm);
                            if result.is_err() {
                                comm.shared.abort();
                            }
                            (result, comm.saw_abort.get())
                        })
                })
                .collect();

            handles
                .into_iter()
                .map(|spawned| match spawned {
                    Ok(handle) => handle.join(),
                    Err(e) => Ok((
                        Err(DistMemError::Communication(format!(
                            "failed to spawn participant thread: {}",
                            e
                        ))),
                        false,
                    )),
                })
                .collect()
        });

        let mut results = Vec::with_capacity(size);
        let mut root_cause = None;
        let mut secondary = None;

        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok((Ok(value), _)) => results.push(value),
                Ok((Err(e), false)) => {
                    root_cause.get_or_insert(e);
                }
                Ok((Err(e), true)) => {
                    secondary.get_or_insert(e);
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::error!("LocalGroup: rank {} panicked: {}", rank, msg);
                    root_cause.get_or_insert(DistMemError::Communication(format!(
                        "participant {} panicked: {}",
                        rank, msg
                    )));
                }
            }
        }

        match root_cause.or(secondary) {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

struct AbortOnPanic<'a>(&'a Shared);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_and_size() {
        let ranks = LocalGroup::run(4, |comm| Ok((comm.rank(), comm.size()))).unwrap();
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(LocalGroup::create(0).unwrap_err().is_user_error());
    }

    #[test]
    fn test_allgather_repeated() {
        let gathered = LocalGroup::run(3, |comm| {
            let first = comm.allgather(comm.rank() * 10)?;
            let second = comm.allgather(comm.rank() + 1)?;
            Ok((first, second))
        })
        .unwrap();

        for (first, second) in gathered {
            assert_eq!(first, vec![0, 10, 20]);
            assert_eq!(second, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_alltoallv_pairwise_chunks() {
        // rank i sends (i + 1) copies of 100 * i + j to rank j
        let received = LocalGroup::run(3, |comm| {
            let p = comm.size();
            let me = comm.rank();
            let sendcounts = vec![me + 1; p];
            let sdispls: Vec<usize> = (0..p).map(|j| j * (me + 1)).collect();
            let send: Vec<u32> = (0..p)
                .flat_map(|j| std::iter::repeat((100 * me + j) as u32).take(me + 1))
                .collect();

            let recvcounts: Vec<usize> = (0..p).map(|i| i + 1).collect();
            let rdispls: Vec<usize> = (0..p).map(|i| (0..i).map(|k| k + 1).sum()).collect();
            let mut recv = vec![0u32; recvcounts.iter().sum()];

            comm.alltoallv(&send, &sendcounts, &sdispls, &mut recv, &recvcounts, &rdispls)?;
            Ok(recv)
        })
        .unwrap();

        assert_eq!(received[0], vec![0, 100, 100, 200, 200, 200]);
        assert_eq!(received[2], vec![2, 102, 102, 202, 202, 202]);
    }

    #[test]
    fn test_count_mismatch_reported() {
        let err = LocalGroup::run(2, |comm| {
            let send = [1u8, 2, 3, 4];
            let mut recv = [0u8; 4];
            // rank 1 expects 2 elements from rank 0, rank 0 only sends 1
            let recvcounts = if comm.rank() == 1 { [2, 2] } else { [1, 1] };
            comm.alltoallv(&send, &[1, 1], &[0, 1], &mut recv, &recvcounts, &[0, 2])
        })
        .unwrap_err();
        assert!(matches!(err, DistMemError::Communication(_)));
        assert!(err.to_string().contains("expected 2 elements"));
    }

    #[test]
    fn test_failing_participant_releases_peers() {
        let err = LocalGroup::run(3, |comm| {
            if comm.rank() == 1 {
                return Err(invalid_argument!("rank 1 gives up"));
            }
            comm.barrier()?;
            comm.barrier()
        })
        .unwrap_err();
        assert!(err.is_user_error(), "root cause should win, got {:?}", err);
    }

    #[test]
    fn test_panicking_participant_releases_peers() {
        let err = LocalGroup::run(2, |comm| {
            if comm.rank() == 0 {
                panic!("boom");
            }
            comm.barrier()
        })
        .unwrap_err();
        assert!(matches!(err, DistMemError::Communication(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_bad_layout_aborts_group() {
        let err = LocalGroup::run(2, |comm| {
            let send = [0u8; 2];
            let mut recv = [0u8; 2];
            let sendcounts = if comm.rank() == 0 { [1, 5] } else { [1, 1] };
            comm.alltoallv(&send, &sendcounts, &[0, 1], &mut recv, &[1, 1], &[0, 1])
        })
        .unwrap_err();
        assert!(err.is_user_error());
    }
}
