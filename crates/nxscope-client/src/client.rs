//! Public NxScope handler: stream lifecycle and subscriber fan-out.
//!
//! [`Nxscope`] wraps the communication handler with the stream dispatcher
//! worker and the per-channel subscriber registry. Each decoded stream
//! frame yields at most one batch per channel; every subscriber of a
//! channel receives its own clone of the batch, so one slow consumer
//! never blocks another (queues are unbounded and the dispatcher never
//! drops).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use nxscope_proto::{
    Device, DeviceChannel, Frame, StreamSample, UserTypeTable,
    stream::stream_decode,
};

use crate::{
    ClientConfig,
    comm::CommHandler,
    error::{ClientError, Result},
    lock,
    transport::Transport,
    worker::{Worker, WorkerJob},
};

/// One batch of samples: everything one stream frame carried for one
/// channel, in arrival order.
pub type SampleBatch = Vec<StreamSample>;

struct SubEntry {
    id: u64,
    tx: Sender<SampleBatch>,
}

type SubRegistry = Vec<Vec<SubEntry>>;

/// Handle to a channel subscription.
///
/// Dropping the handle alone does not unsubscribe; pass it to
/// [`Nxscope::stream_unsub`] to stop the dispatcher from cloning batches
/// into a queue nobody reads.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<SampleBatch>,
}

impl Subscription {
    /// The queue this subscription receives sample batches on.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<SampleBatch> {
        &self.receiver
    }
}

/// Channel selection for [`Nxscope::channels_configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// Every channel the device reports
    All,
    /// An explicit list of channel ids
    Channels(Vec<u8>),
}

/// Divider selection for [`Nxscope::channels_configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DividerConfig {
    /// One divider applied to every selected channel
    Uniform(u8),
    /// One divider per selected channel, same order as the selection
    PerChannel(Vec<u8>),
}

/// NxScope device handler.
///
/// All methods take `&self` and may be called from multiple threads; see
/// the module docs of [`crate::comm`] for the locking story.
pub struct Nxscope {
    comm: Arc<CommHandler>,
    dispatcher: Mutex<Worker>,
    subs: Arc<Mutex<SubRegistry>>,
    next_sub: AtomicU64,
    streaming: Mutex<bool>,
    ovf: Arc<AtomicU64>,
}

impl Nxscope {
    /// Create a handler over `transport` with `cfg`.
    pub fn new(transport: Arc<dyn Transport>, cfg: ClientConfig) -> Self {
        Self {
            comm: Arc::new(CommHandler::new(transport, cfg)),
            dispatcher: Mutex::new(Worker::new("nxscope-dispatch")),
            subs: Arc::new(Mutex::new(Vec::new())),
            next_sub: AtomicU64::new(0),
            streaming: Mutex::new(false),
            ovf: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connect to the device and size the subscriber registry.
    ///
    /// # Errors
    ///
    /// See [`CommHandler::connect`].
    pub fn connect(&self) -> Result<Device> {
        let dev = self.comm.connect()?;
        let mut subs = lock(&self.subs);
        // keep existing subscriptions on a connect-while-connected no-op
        if subs.len() != dev.chmax as usize {
            subs.clear();
            subs.resize_with(dev.chmax as usize, Vec::new);
        }
        Ok(dev)
    }

    /// Stop the stream if needed, disconnect and clear all subscriptions.
    pub fn disconnect(&self) {
        if let Err(err) = self.stream_stop() {
            debug!(%err, "stream stop during disconnect");
        }
        self.comm.disconnect();
        lock(&self.subs).clear();
    }

    /// Current handler lifecycle state.
    #[must_use]
    pub fn state(&self) -> crate::comm::HandlerState {
        self.comm.state()
    }

    /// Snapshot of the device record. `None` while disconnected.
    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.comm.device()
    }

    /// Channel record by id. `None` while disconnected or out of range.
    #[must_use]
    pub fn dev_channel_get(&self, chan: u8) -> Option<DeviceChannel> {
        self.comm.device().and_then(|dev| dev.channel(chan).cloned())
    }

    /// Commit the pending channel configuration, send START and launch
    /// the dispatcher.
    ///
    /// A no-op while already streaming. The overflow counter resets on
    /// every actual start.
    pub fn stream_start(&self) -> Result<()> {
        let mut streaming = lock(&self.streaming);
        if *streaming {
            debug!("stream already started");
            return Ok(());
        }

        let dev = self.comm.device().ok_or(ClientError::NotConnected)?;

        self.ovf.store(0, Ordering::Relaxed);
        self.comm.channels_write()?;
        self.comm.stream_start()?;

        lock(&self.dispatcher).start(DispatchJob {
            rx: self.comm.stream_receiver()?,
            user: self.comm.config().user_types.clone(),
            timeout: self.comm.config().stream_dequeue,
            comm: Arc::clone(&self.comm),
            subs: Arc::clone(&self.subs),
            ovf: Arc::clone(&self.ovf),
            dev,
        });
        *streaming = true;
        info!("stream started");
        Ok(())
    }

    /// Send STOP, stop the dispatcher and discard queued stream frames.
    ///
    /// A no-op while idle.
    pub fn stream_stop(&self) -> Result<()> {
        let mut streaming = lock(&self.streaming);
        if !*streaming {
            return Ok(());
        }

        let result = self.comm.stream_stop();
        lock(&self.dispatcher).stop();
        self.comm.drop_stream_frames();
        *streaming = false;
        info!("stream stopped");
        result
    }

    /// Subscribe to a channel's sample batches.
    ///
    /// Samples arriving for a channel whose confirmed enable state is
    /// false are suppressed before fan-out (they still participate in
    /// frame decoding, since the sample boundary depends on them).
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] or [`ClientError::InvalidChannel`].
    pub fn stream_sub(&self, chan: u8) -> Result<Subscription> {
        let mut subs = lock(&self.subs);
        let chmax = subs.len() as u8;
        if chmax == 0 {
            return Err(ClientError::NotConnected);
        }
        if chan >= chmax {
            return Err(ClientError::InvalidChannel { chan, chmax });
        }

        let (tx, rx) = unbounded();
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        subs[chan as usize].push(SubEntry { id, tx });
        debug!(chan, id, "subscribed");
        Ok(Subscription { id, receiver: rx })
    }

    /// Remove a subscription from whichever channel holds it.
    ///
    /// Idempotent; unknown handles are silently ignored. Takes effect for
    /// the next dispatched batch; a batch already in flight may still
    /// arrive on the handle's queue.
    pub fn stream_unsub(&self, sub: &Subscription) {
        let mut subs = lock(&self.subs);
        for list in subs.iter_mut() {
            list.retain(|entry| entry.id != sub.id);
        }
    }

    /// Stream frames seen with the OVERFLOW flag since the last start.
    #[must_use]
    pub fn ovf_count(&self) -> u64 {
        self.ovf.load(Ordering::Relaxed)
    }

    /// Set the pending enable state for the given channels.
    pub fn ch_enable(&self, chans: &[u8], write_now: bool) -> Result<()> {
        self.comm.ch_enable(chans)?;
        self.maybe_write(write_now)
    }

    /// Clear the pending enable state for the given channels.
    pub fn ch_disable(&self, chans: &[u8], write_now: bool) -> Result<()> {
        self.comm.ch_disable(chans)?;
        self.maybe_write(write_now)
    }

    /// Set the pending divider for the given channels.
    pub fn ch_divider(&self, chans: &[u8], div: u8, write_now: bool) -> Result<()> {
        self.comm.ch_divider(chans, div)?;
        self.maybe_write(write_now)
    }

    /// Set the pending enable state for every channel.
    pub fn ch_enable_all(&self, write_now: bool) -> Result<()> {
        self.comm.ch_enable_all()?;
        self.maybe_write(write_now)
    }

    /// Clear the pending enable state for every channel.
    pub fn ch_disable_all(&self, write_now: bool) -> Result<()> {
        self.comm.ch_disable_all()?;
        self.maybe_write(write_now)
    }

    /// Reset the pending configuration: all disabled, divider 0.
    pub fn channels_default_cfg(&self, write_now: bool) -> Result<()> {
        self.comm.channels_default_cfg()?;
        self.maybe_write(write_now)
    }

    /// Commit the pending channel configuration to the device.
    pub fn channels_write(&self) -> Result<()> {
        self.comm.channels_write()
    }

    /// Device-confirmed enable state of one channel.
    pub fn ch_is_enabled(&self, chan: u8) -> Result<bool> {
        self.comm.ch_is_enabled(chan)
    }

    /// Device-confirmed divider of one channel.
    pub fn ch_div_get(&self, chan: u8) -> Result<u8> {
        self.comm.ch_div_get(chan)
    }

    /// Configure a set of channels in one call: reset to the default
    /// configuration, enable the selection (skipping channels with an
    /// undefined dtype) and apply dividers. Does not commit; call
    /// [`Nxscope::channels_write`] or [`Nxscope::stream_start`].
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidChannel`] for unknown ids and
    /// [`ClientError::DividerLengthMismatch`] when a per-channel divider
    /// list does not cover the selection.
    pub fn channels_configure(
        &self,
        selection: &ChannelSelection,
        div: &DividerConfig,
    ) -> Result<()> {
        let dev = self.comm.device().ok_or(ClientError::NotConnected)?;
        let chans: Vec<u8> = match selection {
            ChannelSelection::All => (0..dev.chmax).collect(),
            ChannelSelection::Channels(list) => list.clone(),
        };
        for &chan in &chans {
            if dev.channel(chan).is_none() {
                return Err(ClientError::InvalidChannel { chan, chmax: dev.chmax });
            }
        }
        if let DividerConfig::PerChannel(list) = div {
            if list.len() != chans.len() {
                return Err(ClientError::DividerLengthMismatch {
                    expected: chans.len(),
                    got: list.len(),
                });
            }
        }

        info!(channels = ?chans, "configuring channels");
        self.comm.channels_default_cfg()?;

        for &chan in &chans {
            let valid = dev.channel(chan).is_some_and(DeviceChannel::is_valid);
            if !valid {
                info!(chan, "channel not valid, ignored");
                continue;
            }
            self.comm.ch_enable(&[chan])?;
        }

        match div {
            DividerConfig::Uniform(value) => {
                self.comm.ch_divider(&chans, *value)?;
            }
            DividerConfig::PerChannel(list) => {
                for (&chan, &value) in chans.iter().zip(list) {
                    self.comm.ch_divider(&[chan], value)?;
                }
            }
        }
        Ok(())
    }

    fn maybe_write(&self, write_now: bool) -> Result<()> {
        if write_now {
            self.comm.channels_write()?;
        }
        Ok(())
    }
}

impl Drop for Nxscope {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Worker job draining the stream queue into subscriber queues.
struct DispatchJob {
    rx: Receiver<Frame>,
    dev: Device,
    user: UserTypeTable,
    comm: Arc<CommHandler>,
    subs: Arc<Mutex<SubRegistry>>,
    ovf: Arc<AtomicU64>,
    timeout: std::time::Duration,
}

impl WorkerJob for DispatchJob {
    fn run(&mut self) {
        // the timeout doubles as the idle tick so the stop flag is seen
        let Ok(frame) = self.rx.recv_timeout(self.timeout) else {
            return;
        };

        let decoded = match stream_decode(&frame.payload, &self.dev, &self.user) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "dropping undecodable stream frame");
                return;
            }
        };

        if decoded.flags.overflow() {
            info!("stream flags: overflow");
            self.ovf.fetch_add(1, Ordering::Relaxed);
        }

        let chmax = self.dev.chmax as usize;
        let mut batches: Vec<SampleBatch> = vec![Vec::new(); chmax];
        for sample in decoded.samples {
            let chan = sample.chan as usize;
            if chan < chmax && self.comm.ch_is_enabled(sample.chan).unwrap_or(false) {
                batches[chan].push(sample);
            }
        }

        let subs = lock(&self.subs);
        for (chan, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            for entry in &subs[chan] {
                // a receiver dropped without unsubscribing is skipped
                let _ = entry.tx.send(batch.clone());
            }
        }
    }
}
