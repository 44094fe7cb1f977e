//! Remote proxy: republish an [`Instrument`](crate::instrument::Instrument)
//! across the network.
//!
//! An [`Exposer`] wraps a local instrument and serves one [`Consumer`] at a
//! time. The consumer opens a session through the handshake channel and then
//! drives the instrument with data channel requests:
//!
//! ```text
//!   Consumer                                   Exposer (instrument "PSU")
//!   ── APP 10.0.0.7:40111 ───── handshake ───▶ subscribe 10.0.0.7:40111, topic PSU
//!   ◀──────────────────────── "PSU 10.0.0.2 45321"
//!   subscribe 10.0.0.2:45321, topic PSU
//!   ── "PSU 1 set VOLT 5" ───── data ───────▶ queued, dispatched by priority
//!   ── "PSU 0 get VOLT" ──────────────────────▶ get_value, then publish
//!   ◀──────────────────────── "PSU VOLT 5.000"
//!   ── STOP ────────────────── handshake ───▶ session ends
//!   ◀──────────────────────── "ACK"
//! ```

use crate::error::HwResult;
use async_trait::async_trait;

pub mod channel;
pub mod consumer;
pub mod exposer;
pub mod protocol;
pub mod session;

pub use channel::{Batch, HandshakeClient, HandshakeServer, Publisher, Subscriber};
pub use consumer::Consumer;
pub use exposer::{Exposer, ExposerHandle};
pub use protocol::{ControlMessage, DataRequest, Reading, RequestAction, Welcome};
pub use session::{PriorityQueue, RemoteSession};

/// Priority used when a caller does not pick one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Something that runs in the background and can be shut down.
///
/// Remote consumers and spawned exposers both implement it, so shutdown code
/// can treat a remote instrument and a local worker the same way.
#[async_trait]
pub trait Join: Send {
    /// Stop and wait until finished. Joining twice is a no-op.
    async fn join(&mut self) -> HwResult<()>;
}

/// Join every worker, in order, and return the first error.
pub async fn join_all(workers: &mut [Box<dyn Join>]) -> HwResult<()> {
    let mut first_error = None;
    for worker in workers.iter_mut() {
        if let Err(e) = worker.join().await {
            tracing::error!("Join failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
