//! Redistribution of block-distributed data across a participant group
//!
//! [`map_alltoall`] turns two globally known partitions into one
//! participant's send/receive counts and displacements. A [`Communicator`]
//! carries out the exchange; [`LocalGroup`] provides one backed by threads
//! of the current process.

pub mod local;
pub mod plan;

pub use local::{LocalCommunicator, LocalGroup};
pub use plan::{map_alltoall, AlltoallPlan};

use crate::error::DistResult;
use crate::invalid_argument;

/// Participant group transport
///
/// All collectives are synchronizing: every participant of the group must
/// call them in the same order, and no receive buffer is valid before the
/// call returns.
pub trait Communicator {
    /// Number of participants
    fn size(&self) -> usize;

    /// This participant's position in `[0, size)`
    fn rank(&self) -> usize;

    fn barrier(&self) -> DistResult<()>;

    /// Gather one value from every participant, in rank order
    fn allgather(&self, value: usize) -> DistResult<Vec<usize>>;

    /// Variable all-to-all exchange
    ///
    /// Sends `send[sdispls[j]..][..sendcounts[j]]` to participant `j` and
    /// stores what participant `i` sends into
    /// `recv[rdispls[i]..][..recvcounts[i]]`. Counts are in elements.
    fn alltoallv<T: Copy + Send + 'static>(
        &self,
        send: &[T],
        sendcounts: &[usize],
        sdispls: &[usize],
        recv: &mut [T],
        recvcounts: &[usize],
        rdispls: &[usize],
    ) -> DistResult<()>;
}

/// Plan the exchange from `local_in` held elements to `local_out` elements
/// when only the local counts are known
///
/// Gathers both counts from every participant, then plans locally. A volume
/// mismatch fails on every participant alike.
pub fn plan_exchange<C: Communicator>(
    comm: &C,
    local_in: usize,
    local_out: usize,
) -> DistResult<AlltoallPlan> {
    let counts_in = comm.allgather(local_in)?;
    let counts_out = comm.allgather(local_out)?;
    map_alltoall(&counts_in, &counts_out, comm.rank())
}

/// Run the exchange described by `plan`
///
/// `send` must hold at least `plan.total_send()` elements and `recv` at
/// least `plan.total_recv()`. Buffers typically come from a
/// [`MemoryPool`](crate::MemoryPool) handle.
pub fn redistribute<C, T>(comm: &C, plan: &AlltoallPlan, send: &[T], recv: &mut [T]) -> DistResult<()>
where
    C: Communicator,
    T: Copy + Send + 'static,
{
    plan.validate()?;
    if plan.num_participants() != comm.size() {
        return Err(invalid_argument!(
            "plan for {} participants used in a group of {}",
            plan.num_participants(),
            comm.size()
        ));
    }
    if send.len() < plan.total_send() {
        return Err(invalid_argument!(
            "send buffer holds {} elements, plan sends {}",
            send.len(),
            plan.total_send()
        ));
    }
    if recv.len() < plan.total_recv() {
        return Err(invalid_argument!(
            "receive buffer holds {} elements, plan receives {}",
            recv.len(),
            plan.total_recv()
        ));
    }

    tracing::debug!(
        "redistribute: rank {} of {} sending {} and receiving {} elements",
        comm.rank(),
        comm.size(),
        plan.total_send(),
        plan.total_recv()
    );

    comm.alltoallv(
        send,
        &plan.sendcounts,
        &plan.sdispls,
        recv,
        &plan.recvcounts,
        &plan.rdispls,
    )
}
