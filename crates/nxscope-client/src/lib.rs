//! Host-side client for NxScope sample streaming devices.
//!
//! The client negotiates device capabilities over a byte-oriented
//! transport, manages per-channel enable/divider configuration, decodes
//! the continuous stream of multi-channel sample frames and fans the
//! samples out to in-process subscribers.
//!
//! Three long-lived threads do the work: the transport's own worker (if
//! it has one), the receive pipeline ([`recv`], frames-to-queues) and the
//! stream dispatcher (stream-queue-to-subscribers). All blocking waits
//! are bounded-time queue dequeues; the control path uses a 1 second
//! timeout by default.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nxscope_client::{ClientConfig, Nxscope};
//! # fn transport() -> Arc<dyn nxscope_client::Transport> { unreachable!() }
//!
//! # fn main() -> Result<(), nxscope_client::ClientError> {
//! let scope = Nxscope::new(transport(), ClientConfig::default());
//! let device = scope.connect()?;
//!
//! let sub = scope.stream_sub(0)?;
//! scope.ch_enable(&[0], false)?;
//! scope.stream_start()?;
//!
//! for batch in sub.receiver().iter().take(10) {
//!     println!("{} samples on channel 0", batch.len());
//! }
//!
//! scope.stream_stop()?;
//! scope.disconnect();
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use nxscope_proto::UserTypeTable;

pub mod client;
pub mod comm;
pub mod error;
pub mod recv;
pub mod transport;
pub mod worker;

pub use client::{
    ChannelSelection, DividerConfig, Nxscope, SampleBatch, Subscription,
};
pub use comm::{CommHandler, HandlerState};
pub use error::{ClientError, Result};
pub use transport::Transport;
pub use worker::{Worker, WorkerJob};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-path dequeue timeout (ACK and handshake replies).
    pub ack_timeout: Duration,

    /// Attempts per handshake request before connect fails with
    /// [`ClientError::Timeout`].
    pub handshake_retries: u32,

    /// Dispatcher idle tick: how long a stream dequeue waits before the
    /// worker re-checks its stop flag.
    pub stream_dequeue: Duration,

    /// Host-registered decoders for user dtypes 20..=31.
    pub user_types: UserTypeTable,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            handshake_retries: 5,
            stream_dequeue: Duration::from_secs(1),
            user_types: UserTypeTable::new(),
        }
    }
}

/// Lock a mutex, recovering the guard if a worker panicked while holding
/// it. The protected state is plain data that stays consistent across a
/// poisoned unlock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
