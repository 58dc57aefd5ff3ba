//! Periodic rebroadcast of unconfirmed inventory.
//!
//! Inventory submitted by this node is re-relayed at jittered intervals
//! until it makes it into a block, in case peers restarted or otherwise
//! lost track of it. The pending map is owned exclusively by this task;
//! other components talk to it over the modify channel.

use crate::server::{RelayPayload, Server};
use aurum_wire::{InvVect, TxKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace};

/// Delay before the first rebroadcast pass.
const FIRST_REBROADCAST_DELAY: Duration = Duration::from_secs(5 * 60);

/// Upper bound, in seconds, of the random delay between rebroadcasts.
const MAX_REBROADCAST_INTERVAL_SECS: u16 = 1800;

/// Mutations applied to the pending rebroadcast inventory.
pub(crate) enum RebroadcastRequest {
    /// Track new inventory until it shows up in a block.
    Add {
        inv: InvVect,
        payload: RelayPayload,
    },
    /// The inventory made it into a block; stop rebroadcasting it.
    Del(InvVect),
    /// Remove entries invalidated by the current chain state.
    Prune,
}

/// Returns a uniformly distributed random number in `[0, max)`.
///
/// Samples are rejected above the largest multiple of `max` that fits in a
/// `u16`; reducing an unrestricted sample with a plain modulus would bias
/// toward small values.
pub fn random_uint16(max: u16) -> u16 {
    let limit_range = (u16::MAX / max) * max;
    loop {
        let sample: u16 = rand::random();
        if sample < limit_range {
            return sample % max;
        }
    }
}

/// Long-running task owning the pending rebroadcast inventory.
pub(crate) async fn rebroadcast_loop(
    server: Server,
    mut modify_rx: mpsc::Receiver<RebroadcastRequest>,
) {
    let mut pending: HashMap<InvVect, RelayPayload> = HashMap::new();
    let timer = sleep(FIRST_REBROADCAST_DELAY);
    tokio::pin!(timer);
    let mut quit = server.quit_signal();

    enum Event {
        Modify(RebroadcastRequest),
        Tick,
        Quit,
    }

    loop {
        // The actual relay await is kept outside of `select!` below: awaiting
        // inside a branch here would force the whole select future to be
        // `Send` across that await while another branch (`quit.wait_for`) is
        // holding a non-`Send` guard, which tokio::spawn rejects.
        let event = tokio::select! {
            Some(request) = modify_rx.recv() => Event::Modify(request),
            () = &mut timer => Event::Tick,
            _ = quit.wait_for(|quit| *quit) => Event::Quit,
        };

        match event {
            Event::Modify(request) => match request {
                RebroadcastRequest::Add { inv, payload } => {
                    pending.insert(inv, payload);
                }
                RebroadcastRequest::Del(inv) => {
                    pending.remove(&inv);
                }
                RebroadcastRequest::Prune => {
                    prune_pending(&mut pending, &server);
                }
            },
            Event::Tick => {
                // Everything still pending has not made it into a block;
                // resubmit it through the normal relay path.
                for (inv, payload) in &pending {
                    server.relay_inventory(*inv, payload.clone(), false).await;
                }

                let delay = u64::from(random_uint16(MAX_REBROADCAST_INTERVAL_SECS)) + 1;
                timer.as_mut().reset(Instant::now() + Duration::from_secs(delay));
            }
            Event::Quit => break,
        }
    }

    // Drain the modify channel so no sender is left waiting.
    while modify_rx.try_recv().is_ok() {}
    trace!("rebroadcast handler done");
}

/// Drop pending entries the chain has made unrelayable.
fn prune_pending(pending: &mut HashMap<InvVect, RelayPayload>, server: &Server) {
    let chain = &server.subsystems().chain;
    let best = chain.best_snapshot();
    let next_stake_diff = match chain.next_stake_difficulty() {
        Ok(diff) => diff,
        Err(e) => {
            error!(error = %e, "failed to get next stake difficulty");
            return;
        }
    };

    pending.retain(|_inv, payload| {
        let RelayPayload::Transaction(tx) = payload else {
            return true;
        };

        match tx.kind {
            TxKind::TicketPurchase => {
                // A ticket whose price no longer matches the required stake
                // difficulty can never be mined.
                if tx.outputs.first().map(|out| out.value) != Some(next_stake_diff) {
                    debug!(
                        tx = %tx.hash(),
                        "dropping pending ticket rebroadcast, value not equal to stake difficulty"
                    );
                    return false;
                }
                if tx.is_expired(best.height) {
                    debug!(tx = %tx.hash(), "dropping pending ticket rebroadcast, expired");
                    return false;
                }
                true
            }
            TxKind::Revocation => {
                // A revocation only makes sense for a ticket that is no
                // longer live.
                let Some(ticket) = tx.inputs.first().map(|input| input.previous_outpoint.hash)
                else {
                    return true;
                };
                if chain.check_live_ticket(&ticket) {
                    debug!(
                        tx = %tx.hash(),
                        "dropping pending revocation rebroadcast, ticket is live"
                    );
                    return false;
                }
                true
            }
            TxKind::Regular | TxKind::Vote => true,
        }
    });
}
