//! Communication glue: handshake, ACK correlation and channel state.
//!
//! [`CommHandler`] owns the transport, the receive worker and both frame
//! queues. The request/reply path is serialized on the session lock, so
//! the next control-queue frame after a request is its reply (the
//! protocol has no sequence numbers). STREAM frames are routed to a
//! separate queue by the receive pipeline, which removes them from the
//! control path entirely; an ACK racing a STREAM frame on a slow link is
//! an acknowledged limitation this design cannot detect, only avoid.
//!
//! Channel configuration keeps two snapshots per channel under one lock:
//! `*_now` (last device-confirmed values) and `*_new` (pending values).
//! [`CommHandler::channels_write`] computes the diff under the lock,
//! releases it, emits the minimal set-frame and promotes the committed
//! snapshot once the device acknowledges.
//!
//! Lock order, when both are needed: session lock before channel-state
//! lock. Neither is held while another thread needs them to make
//! progress; queue waits happen only under the session lock, which the
//! receive and dispatch workers never take.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, unbounded};
use tracing::{debug, info, warn};

use nxscope_proto::{
    Device, DeviceChannel, Frame, SetRequest,
    payloads::{self, Cmninfo},
};

use crate::{
    ClientConfig,
    error::{ClientError, Result},
    lock,
    recv::RecvJob,
    transport::Transport,
    worker::Worker,
};

/// Polling timeout used while draining stale frames.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Consecutive empty polls before a queue counts as drained.
const DRAIN_EMPTY_POLLS: u32 = 4;

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// No session; the device record is empty
    Disconnected,
    /// Connect handshake in progress
    Connecting,
    /// Handshake complete; device record populated
    Connected,
    /// Teardown in progress
    Disconnecting,
}

/// Channel enable/divider snapshots, all `chmax` long.
#[derive(Debug, Default)]
struct ChannelsState {
    en_now: Vec<bool>,
    en_new: Vec<bool>,
    div_now: Vec<u8>,
    div_new: Vec<u8>,
}

impl ChannelsState {
    fn init(&mut self, en: Vec<bool>, div: Vec<u8>) {
        self.en_now = en.clone();
        self.en_new = en;
        self.div_now = div.clone();
        self.div_new = div;
    }

    fn clear(&mut self) {
        self.en_now.clear();
        self.en_new.clear();
        self.div_now.clear();
        self.div_new.clear();
    }

    fn chmax(&self) -> u8 {
        self.en_now.len() as u8
    }

    fn check_chan(&self, chan: u8) -> Result<()> {
        let chmax = self.chmax();
        if chmax == 0 {
            return Err(ClientError::NotConnected);
        }
        if chan >= chmax {
            return Err(ClientError::InvalidChannel { chan, chmax });
        }
        Ok(())
    }
}

/// Per-connection state guarded by the session lock.
#[derive(Debug)]
struct Session {
    state: HandlerState,
    dev: Option<Device>,
    ctrl_rx: Option<Receiver<Frame>>,
    stream_rx: Option<Receiver<Frame>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: HandlerState::Disconnected,
            dev: None,
            ctrl_rx: None,
            stream_rx: None,
        }
    }
}

/// Communication handler: transport + receive worker + command path.
pub struct CommHandler {
    cfg: ClientConfig,
    transport: Arc<dyn Transport>,
    dev_ready: Arc<AtomicBool>,
    recv: Mutex<Worker>,
    session: Mutex<Session>,
    channels: Mutex<ChannelsState>,
}

impl CommHandler {
    /// Create a handler over `transport`. No I/O happens until
    /// [`CommHandler::connect`].
    pub fn new(transport: Arc<dyn Transport>, cfg: ClientConfig) -> Self {
        Self {
            cfg,
            transport,
            dev_ready: Arc::new(AtomicBool::new(false)),
            recv: Mutex::new(Worker::new("nxscope-recv")),
            session: Mutex::new(Session::default()),
            channels: Mutex::new(ChannelsState::default()),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandlerState {
        lock(&self.session).state
    }

    /// Snapshot of the device record. `None` while disconnected.
    pub fn device(&self) -> Option<Device> {
        lock(&self.session).dev.clone()
    }

    /// Connect to the device: start the transport and receive worker,
    /// run the discovery handshake and initialize the channel snapshots.
    ///
    /// Calling this while connected is a warning no-op that returns the
    /// existing device record.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when the handshake retry budget is
    /// exhausted; transport errors pass through. On failure the handler
    /// is back in [`HandlerState::Disconnected`].
    pub fn connect(&self) -> Result<Device> {
        let mut session = lock(&self.session);
        if session.state == HandlerState::Connected {
            warn!("connect ignored: already connected");
            return session.dev.clone().ok_or(ClientError::NotConnected);
        }
        session.state = HandlerState::Connecting;

        if let Err(err) = self.transport.start() {
            session.state = HandlerState::Disconnected;
            return Err(err);
        }

        let (ctrl_tx, ctrl_rx) = unbounded();
        let (stream_tx, stream_rx) = unbounded();
        self.dev_ready.store(false, Ordering::Release);
        lock(&self.recv).start(RecvJob::new(
            Arc::clone(&self.transport),
            ctrl_tx,
            stream_tx,
            Arc::clone(&self.dev_ready),
        ));
        session.ctrl_rx = Some(ctrl_rx);
        session.stream_rx = Some(stream_rx);

        match self.handshake(&session) {
            Ok(dev) => {
                lock(&self.channels).init(dev.channels_en(), dev.channels_div());
                self.dev_ready.store(true, Ordering::Release);
                session.dev = Some(dev.clone());
                session.state = HandlerState::Connected;
                info!(chmax = dev.chmax, "connected");
                Ok(dev)
            }
            Err(err) => {
                warn!(%err, "connect failed");
                lock(&self.recv).stop();
                self.transport.stop();
                session.ctrl_rx = None;
                session.stream_rx = None;
                session.dev = None;
                session.state = HandlerState::Disconnected;
                Err(err)
            }
        }
    }

    /// Disconnect from the device and tear down the workers.
    ///
    /// A no-op while disconnected.
    pub fn disconnect(&self) {
        let mut session = lock(&self.session);
        if session.state == HandlerState::Disconnected {
            return;
        }
        session.state = HandlerState::Disconnecting;

        lock(&self.recv).stop();
        self.transport.stop();
        self.drop_all(&session);
        self.dev_ready.store(false, Ordering::Release);

        session.ctrl_rx = None;
        session.stream_rx = None;
        session.dev = None;
        lock(&self.channels).clear();
        session.state = HandlerState::Disconnected;
        info!("disconnected");
    }

    /// Send a stream START request and await the ACK.
    pub fn stream_start(&self) -> Result<()> {
        self.start_request(true)
    }

    /// Send a stream STOP request and await the ACK.
    pub fn stream_stop(&self) -> Result<()> {
        self.start_request(false)
    }

    fn start_request(&self, start: bool) -> Result<()> {
        let session = lock(&self.session);
        if session.state != HandlerState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.transport.write_aligned(&payloads::start_frame(start))?;
        self.await_ack(&session)
    }

    /// Clone of the stream-queue receiver for the dispatcher.
    pub fn stream_receiver(&self) -> Result<Receiver<Frame>> {
        lock(&self.session).stream_rx.clone().ok_or(ClientError::NotConnected)
    }

    /// Discard any stream frames still queued.
    pub fn drop_stream_frames(&self) {
        if let Some(rx) = lock(&self.session).stream_rx.clone() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Set the pending enable state for the given channels.
    pub fn ch_enable(&self, chans: &[u8]) -> Result<()> {
        self.set_en(chans, true)
    }

    /// Clear the pending enable state for the given channels.
    pub fn ch_disable(&self, chans: &[u8]) -> Result<()> {
        self.set_en(chans, false)
    }

    fn set_en(&self, chans: &[u8], en: bool) -> Result<()> {
        let mut state = lock(&self.channels);
        for &chan in chans {
            state.check_chan(chan)?;
        }
        for &chan in chans {
            state.en_new[chan as usize] = en;
        }
        Ok(())
    }

    /// Set the pending enable state for every channel.
    pub fn ch_enable_all(&self) -> Result<()> {
        self.set_en_all(true)
    }

    /// Clear the pending enable state for every channel.
    pub fn ch_disable_all(&self) -> Result<()> {
        self.set_en_all(false)
    }

    fn set_en_all(&self, en: bool) -> Result<()> {
        let mut state = lock(&self.channels);
        if state.chmax() == 0 {
            return Err(ClientError::NotConnected);
        }
        state.en_new.fill(en);
        Ok(())
    }

    /// Set the pending divider for the given channels.
    ///
    /// When the device lacks divider support a nonzero value is accepted
    /// with a warning; the commit step will not emit a DIV frame.
    pub fn ch_divider(&self, chans: &[u8], div: u8) -> Result<()> {
        {
            let session = lock(&self.session);
            let dev = session.dev.as_ref().ok_or(ClientError::NotConnected)?;
            if !dev.flags.div_supported() && div > 0 {
                warn!("divider not supported by the device");
            }
        }

        let mut state = lock(&self.channels);
        for &chan in chans {
            state.check_chan(chan)?;
        }
        for &chan in chans {
            state.div_new[chan as usize] = div;
        }
        Ok(())
    }

    /// Reset the pending configuration: all channels disabled, divider 0.
    ///
    /// Does not commit; call [`CommHandler::channels_write`].
    pub fn channels_default_cfg(&self) -> Result<()> {
        let mut state = lock(&self.channels);
        if state.chmax() == 0 {
            return Err(ClientError::NotConnected);
        }
        state.en_new.fill(false);
        state.div_new.fill(0);
        Ok(())
    }

    /// Device-confirmed enable state of one channel.
    pub fn ch_is_enabled(&self, chan: u8) -> Result<bool> {
        let state = lock(&self.channels);
        state.check_chan(chan)?;
        Ok(state.en_now[chan as usize])
    }

    /// Device-confirmed divider of one channel.
    pub fn ch_div_get(&self, chan: u8) -> Result<u8> {
        let state = lock(&self.channels);
        state.check_chan(chan)?;
        Ok(state.div_now[chan as usize])
    }

    /// Commit the pending channel configuration to the device.
    ///
    /// Emits the minimal wire form per configuration kind: nothing
    /// without a diff, SINGLE for a one-channel diff, otherwise a full
    /// vector (which the codec emits as ALL when uniform, BULK when
    /// mixed). The divider frame goes first, and only on devices with
    /// divider support, so a new rate is never applied after a channel
    /// already streams at full rate.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when the ACK does not arrive and
    /// [`ClientError::Nack`] on a nonzero return code; in both cases the
    /// confirmed snapshots keep their previous values.
    pub fn channels_write(&self) -> Result<()> {
        let mut session = lock(&self.session);
        if session.state != HandlerState::Connected {
            return Err(ClientError::NotConnected);
        }

        let div_supported =
            session.dev.as_ref().is_some_and(|dev| dev.flags.div_supported());
        if div_supported {
            self.commit_div(&mut session)?;
        }
        self.commit_en(&mut session)?;
        Ok(())
    }

    fn commit_en(&self, session: &mut Session) -> Result<()> {
        let (request, committed) = {
            let state = lock(&self.channels);
            let diff: Vec<usize> = (0..state.en_now.len())
                .filter(|&i| state.en_new[i] != state.en_now[i])
                .collect();
            let snapshot = state.en_new.clone();
            match diff.as_slice() {
                [] => return Ok(()),
                &[chan] => (
                    SetRequest::Single { chan: chan as u8, value: snapshot[chan] },
                    snapshot,
                ),
                _ => (SetRequest::Vector(snapshot.clone()), snapshot),
            }
        };

        let frame = payloads::enable_frame(&request, committed.len() as u8)?;
        self.transport.write_aligned(&frame)?;
        self.await_ack(session)?;

        lock(&self.channels).en_now = committed.clone();
        if let Some(dev) = session.dev.as_mut() {
            dev.update_en(&committed);
        }
        Ok(())
    }

    fn commit_div(&self, session: &mut Session) -> Result<()> {
        let (request, committed) = {
            let state = lock(&self.channels);
            let diff: Vec<usize> = (0..state.div_now.len())
                .filter(|&i| state.div_new[i] != state.div_now[i])
                .collect();
            let snapshot = state.div_new.clone();
            match diff.as_slice() {
                [] => return Ok(()),
                &[chan] => (
                    SetRequest::Single { chan: chan as u8, value: snapshot[chan] },
                    snapshot,
                ),
                _ => (SetRequest::Vector(snapshot.clone()), snapshot),
            }
        };

        let frame = payloads::div_frame(&request, committed.len() as u8)?;
        self.transport.write_aligned(&frame)?;
        self.await_ack(session)?;

        lock(&self.channels).div_now = committed.clone();
        if let Some(dev) = session.dev.as_mut() {
            dev.update_div(&committed);
        }
        Ok(())
    }

    /// Await the ACK for the request just written.
    ///
    /// Success is synthesized when the device record is not yet populated
    /// (handshake-time defensive requests) or the device does not
    /// advertise ACK support.
    fn await_ack(&self, session: &Session) -> Result<()> {
        let Some(dev) = session.dev.as_ref() else {
            return Ok(());
        };
        if !dev.flags.ack_supported() {
            return Ok(());
        }

        let rx = session.ctrl_rx.as_ref().ok_or(ClientError::NotConnected)?;
        let frame = rx
            .recv_timeout(self.cfg.ack_timeout)
            .map_err(|_| ClientError::Timeout(self.cfg.ack_timeout))?;
        let ack = payloads::ack_decode(&frame)?;
        if !ack.ok() {
            return Err(ClientError::Nack(ack.retcode));
        }
        Ok(())
    }

    fn handshake(&self, session: &Session) -> Result<Device> {
        // defensive stop in case the device is already mid-stream; the
        // device record does not exist yet so no ACK is awaited (the
        // receive worker drops it)
        self.transport.write_aligned(&payloads::start_frame(false))?;
        self.drop_all(session);

        info!("requesting device info");
        let info = self.retry_cmninfo(session)?;

        if info.rxpadding > 0 && info.rxpadding != self.transport.write_padding() {
            info!(rxpadding = info.rxpadding, "reconfiguring transport write padding");
            self.transport.set_write_padding(info.rxpadding);
            // An RX-DMA device latches its receive trigger only on full
            // alignment blocks; this NUL write flushes frames it buffered
            // before the padding was known.
            self.transport.write(&vec![0u8; info.rxpadding as usize])?;
        }
        self.drop_all(session);

        let mut channels = Vec::with_capacity(info.chmax as usize);
        for chan in 0..info.chmax {
            let ch = self.retry_chinfo(session, chan)?;
            debug!(chan, name = %ch.name, "channel info");
            channels.push(ch);
        }

        Ok(Device::new(info.chmax, info.flags, info.rxpadding, channels)?)
    }

    fn retry_cmninfo(&self, session: &Session) -> Result<Cmninfo> {
        for attempt in 0..self.cfg.handshake_retries {
            if let Some(info) = self.cmninfo(session) {
                return Ok(info);
            }
            debug!(attempt, "cmninfo retry");
        }
        Err(ClientError::Timeout(self.cfg.ack_timeout))
    }

    fn retry_chinfo(&self, session: &Session, chan: u8) -> Result<DeviceChannel> {
        for attempt in 0..self.cfg.handshake_retries {
            if let Some(ch) = self.chinfo(session, chan) {
                return Ok(ch);
            }
            debug!(chan, attempt, "chinfo retry");
        }
        Err(ClientError::Timeout(self.cfg.ack_timeout))
    }

    fn cmninfo(&self, session: &Session) -> Option<Cmninfo> {
        self.transport.write_aligned(&payloads::cmninfo_frame()).ok()?;
        let frame = self.ctrl_frame(session)?;
        payloads::cmninfo_decode(&frame).ok()
    }

    fn chinfo(&self, session: &Session, chan: u8) -> Option<DeviceChannel> {
        self.transport.write_aligned(&payloads::chinfo_frame(chan)).ok()?;
        let frame = self.ctrl_frame(session)?;
        payloads::chinfo_decode(&frame, chan).ok()
    }

    fn ctrl_frame(&self, session: &Session) -> Option<Frame> {
        session.ctrl_rx.as_ref()?.recv_timeout(self.cfg.ack_timeout).ok()
    }

    /// Drop buffered transport data and drain both frame queues.
    fn drop_all(&self, session: &Session) {
        self.transport.drop_all();
        if let Some(rx) = session.ctrl_rx.as_ref() {
            drain_queue(rx);
        }
        if let Some(rx) = session.stream_rx.as_ref() {
            drain_queue(rx);
        }
    }
}

/// Drain a queue until it stays empty for a few consecutive polls.
fn drain_queue(rx: &Receiver<Frame>) {
    let mut empties = 0;
    while empties < DRAIN_EMPTY_POLLS {
        match rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(_) => {}
            Err(_) => empties += 1,
        }
    }
}
