//! Background tasks that keep a mirror in step with the durable store and
//! the broadcast channel.

mod applier;
mod reconcile;
mod retry;
mod supervisor;
mod termination;

pub use applier::{MoveApplier, OutboundMove};
pub use reconcile::{Inbound, ReconciliationEngine, ResyncHandle};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use termination::{SettlementOutcome, TerminationCoordinator};

pub(crate) use applier::Outbox;
pub(crate) use reconcile::ResyncFetcher;
pub(crate) use retry::with_backoff;

use tokio::sync::watch;

pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
