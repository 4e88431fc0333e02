//! Loopback simulated device.
//!
//! [`SimDevice`] implements the client's `Transport` trait and mirrors the
//! device side of the protocol through the shared `nxscope-proto` codecs:
//! a worker thread parses request frames written by the host, answers
//! cmninfo/chinfo/start/enable/div, and generates stream frames from
//! per-channel [`SignalGen`] sources while streaming is on.
//!
//! Every request observed on the wire is recorded in [`SimStats`], so
//! tests can assert not just outcomes but wire shapes (for instance that
//! a one-channel configuration change arrived as a SINGLE set-frame).

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use nxscope_client::{ClientError, Transport, Worker, WorkerJob};
use nxscope_proto::{
    ChannelSample, ChannelType, Device, DeviceChannel, DeviceFlags, Frame, FrameHeader, FrameId,
    HDR_LEN, UserTypeTable,
    payloads::{self, SetFlags},
    sof_find,
    stream::{StreamFlags, stream_encode},
};

use crate::r#gen::{
    ConstVectorGen, CountedMetaGen, MetaOnlyGen, RandomGen, RandomVectorGen, SawtoothGen,
    SignalGen, TextGen, TriangleGen,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One optional generator per channel, indexed by channel id.
pub type GenSlots = Vec<Option<Box<dyn SignalGen>>>;

/// A request observed by the simulated device, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// CMNINFO request
    Cmninfo,
    /// CHINFO request for one channel
    Chinfo(u8),
    /// START request with its start/stop flag
    Start(bool),
    /// ENABLE set-frame with its envelope flavor
    Enable(SetFlags),
    /// DIV set-frame with its envelope flavor
    Div(SetFlags),
}

/// Wire-level request log of a [`SimDevice`].
#[derive(Debug, Default)]
pub struct SimStats {
    events: Mutex<Vec<SimEvent>>,
}

impl SimStats {
    fn push(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    /// All requests seen so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.events).clone()
    }

    /// Only the ENABLE/DIV set-frames, oldest first.
    #[must_use]
    pub fn set_frames(&self) -> Vec<SimEvent> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, SimEvent::Enable(_) | SimEvent::Div(_)))
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

/// Tuning knobs for the simulated stream source.
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    /// Sleep between stream frames while streaming.
    pub stream_interval: Duration,
    /// Generator polls per enabled channel per stream frame.
    pub samples_per_tick: u32,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self { stream_interval: Duration::from_millis(1), samples_per_tick: 10 }
    }
}

/// In-process NxScope device behind the client's transport seam.
pub struct SimDevice {
    dev: Arc<Mutex<Device>>,
    gens: Arc<Mutex<GenSlots>>,
    user: UserTypeTable,
    cfg: SimDeviceConfig,
    to_host: Sender<Vec<u8>>,
    from_dev: Receiver<Vec<u8>>,
    to_dev: Sender<Vec<u8>>,
    from_host: Receiver<Vec<u8>>,
    streaming: Arc<AtomicBool>,
    worker: Mutex<Worker>,
    padding: AtomicU8,
    stats: Arc<SimStats>,
}

impl SimDevice {
    /// Simulate `dev` with one optional generator per channel (indexed by
    /// channel id).
    pub fn new(
        dev: Device,
        gens: GenSlots,
        user: UserTypeTable,
        cfg: SimDeviceConfig,
    ) -> Self {
        let (to_dev, from_host) = unbounded();
        let (to_host, from_dev) = unbounded();
        Self {
            dev: Arc::new(Mutex::new(dev)),
            gens: Arc::new(Mutex::new(gens)),
            user,
            cfg,
            to_host,
            from_dev,
            to_dev,
            from_host,
            streaming: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(Worker::new("sim-device")),
            padding: AtomicU8::new(0),
            stats: Arc::new(SimStats::default()),
        }
    }

    /// Simulator with the default ten-channel device.
    #[must_use]
    pub fn with_default_device() -> Self {
        let (dev, gens) = default_device();
        Self::new(dev, gens, UserTypeTable::new(), SimDeviceConfig::default())
    }

    /// Wire-level request log.
    #[must_use]
    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the simulated device state.
    #[must_use]
    pub fn device(&self) -> Device {
        lock(&self.dev).clone()
    }

    /// True while a START(true) is in effect.
    #[must_use]
    pub fn streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Push raw bytes into the host's receive path, bypassing the
    /// simulated protocol. Used to exercise resync and overflow handling.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.to_host.send(bytes.to_vec());
    }
}

impl Transport for SimDevice {
    fn start(&self) -> Result<(), ClientError> {
        for slot in lock(&self.gens).iter_mut().flatten() {
            slot.reset();
        }
        self.streaming.store(false, Ordering::SeqCst);
        lock(&self.worker).start(SimJob {
            dev: Arc::clone(&self.dev),
            gens: Arc::clone(&self.gens),
            user: self.user.clone(),
            rx: self.from_host.clone(),
            tx: self.to_host.clone(),
            streaming: Arc::clone(&self.streaming),
            stats: Arc::clone(&self.stats),
            carry: Vec::new(),
            interval: self.cfg.stream_interval,
            snum: self.cfg.samples_per_tick,
        });
        debug!("sim device started");
        Ok(())
    }

    fn stop(&self) {
        lock(&self.worker).stop();
        while self.from_dev.try_recv().is_ok() {}
        while self.from_host.try_recv().is_ok() {}
        debug!("sim device stopped");
    }

    fn drop_all(&self) {}

    fn read(&self) -> Vec<u8> {
        self.from_dev.recv_timeout(Duration::from_secs(1)).unwrap_or_default()
    }

    fn write(&self, data: &[u8]) -> Result<(), ClientError> {
        self.to_dev
            .send(data.to_vec())
            .map_err(|_| ClientError::Transport("simulated device is gone".to_string()))
    }

    fn write_padding(&self) -> u8 {
        self.padding.load(Ordering::Relaxed)
    }

    fn set_write_padding(&self, padding: u8) {
        self.padding.store(padding, Ordering::Relaxed);
    }
}

/// The default device: a spread of scalar, vector, text, metadata and
/// invalid channels, dividers and ACKs supported, 16-byte RX padding.
#[must_use]
pub fn default_device() -> (Device, GenSlots) {
    let channels = vec![
        DeviceChannel::new(0, ChannelType::Float, 1, "chan0"),
        DeviceChannel::new(1, ChannelType::Float, 1, "chan1"),
        DeviceChannel::new(2, ChannelType::Float, 1, "chan2"),
        DeviceChannel::new(3, ChannelType::Float, 2, "chan3"),
        DeviceChannel::new(4, ChannelType::Float, 3, "chan4"),
        DeviceChannel::new(5, ChannelType::Float, 3, "chan5"),
        DeviceChannel::new(6, ChannelType::Char, 64, "chan6"),
        DeviceChannel::with_mlen(7, ChannelType::Int8, 3, "chan7", 1),
        DeviceChannel::with_mlen(8, ChannelType::None, 0, "chan8", 16),
        DeviceChannel::new(9, ChannelType::Undef, 0, ""),
    ];
    let gens: GenSlots = vec![
        Some(Box::new(RandomGen)),
        Some(Box::new(SawtoothGen::default())),
        Some(Box::new(TriangleGen::default())),
        Some(Box::new(RandomVectorGen::new(2))),
        Some(Box::new(RandomVectorGen::new(3))),
        Some(Box::new(ConstVectorGen::new(vec![1.0, 0.0, -1.0]))),
        Some(Box::new(TextGen::new(10_000, 64))),
        Some(Box::new(CountedMetaGen::default())),
        Some(Box::new(MetaOnlyGen::new(
            b"hello\0\0\0\0\0\0\0\0\0\0\0".iter().map(|&b| u64::from(b)).collect(),
        ))),
        None,
    ];

    let flags = DeviceFlags::from_byte(DeviceFlags::DIVIDER_SUPPORT | DeviceFlags::ACK_SUPPORT);
    match Device::new(10, flags, 16, channels) {
        Ok(dev) => (dev, gens),
        // the static channel table has unique ids and matches chmax
        Err(_) => unreachable!("default device table is valid"),
    }
}

/// Device-side worker: request parsing plus stream generation.
struct SimJob {
    dev: Arc<Mutex<Device>>,
    gens: Arc<Mutex<GenSlots>>,
    user: UserTypeTable,
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    streaming: Arc<AtomicBool>,
    stats: Arc<SimStats>,
    carry: Vec<u8>,
    interval: Duration,
    snum: u32,
}

impl WorkerJob for SimJob {
    fn run(&mut self) {
        if let Ok(data) = self.rx.recv_timeout(Duration::from_millis(1)) {
            self.carry.extend_from_slice(&data);
            self.process();
        }
        if self.streaming.load(Ordering::SeqCst) {
            self.stream_tick();
            std::thread::sleep(self.interval);
        }
    }
}

impl SimJob {
    /// Pull every complete frame out of the carry buffer. Writes are
    /// NUL-padded by the host transport, so garbage between frames is
    /// expected and skipped.
    fn process(&mut self) {
        loop {
            match sof_find(&self.carry) {
                Some(0) => {}
                Some(at) => {
                    self.carry.drain(..at);
                }
                None => {
                    self.carry.clear();
                    return;
                }
            }
            if self.carry.len() < HDR_LEN {
                return;
            }
            let Ok(hdr) = FrameHeader::decode(&self.carry) else {
                self.carry.drain(..1);
                continue;
            };
            let flen = hdr.len as usize;
            if self.carry.len() < flen {
                return;
            }
            match Frame::decode(&self.carry[..flen]) {
                Ok(frame) => {
                    self.carry.drain(..flen);
                    self.handle(&frame);
                }
                Err(_) => {
                    self.carry.drain(..1);
                }
            }
        }
    }

    fn handle(&mut self, frame: &Frame) {
        match frame.id {
            FrameId::Cmninfo => {
                self.stats.push(SimEvent::Cmninfo);
                let reply = payloads::cmninfo_reply(&lock(&self.dev));
                let _ = self.tx.send(reply.to_vec());
            }
            FrameId::Chinfo => {
                let Some(&chan) = frame.payload.first() else {
                    warn!("chinfo request without a channel id");
                    return;
                };
                self.stats.push(SimEvent::Chinfo(chan));
                let dev = lock(&self.dev);
                if let Some(ch) = dev.channel(chan) {
                    let reply = payloads::chinfo_reply(ch);
                    let _ = self.tx.send(reply.to_vec());
                }
            }
            FrameId::Enable => self.handle_enable(&frame.payload),
            FrameId::Div => self.handle_div(&frame.payload),
            FrameId::Start => {
                let Ok(start) = payloads::start_decode(&frame.payload) else {
                    warn!("malformed start request");
                    return;
                };
                self.stats.push(SimEvent::Start(start));
                self.streaming.store(start, Ordering::SeqCst);
                self.send_ack();
            }
            FrameId::Stream | FrameId::Ack | FrameId::Undef | FrameId::Invalid => {
                debug!(id = ?frame.id, "unexpected frame on the device side");
            }
        }
    }

    fn handle_enable(&mut self, payload: &[u8]) {
        let Some(shape) = payload.first().copied().and_then(SetFlags::from_u8) else {
            warn!("malformed enable request");
            return;
        };
        let mut dev = lock(&self.dev);
        let current = dev.channels_en();
        match payloads::enable_decode(payload, &current, dev.chmax) {
            Ok(new) => {
                dev.update_en(&new);
                drop(dev);
                self.stats.push(SimEvent::Enable(shape));
                self.send_ack();
            }
            Err(err) => warn!(%err, "enable decode failed"),
        }
    }

    fn handle_div(&mut self, payload: &[u8]) {
        let Some(shape) = payload.first().copied().and_then(SetFlags::from_u8) else {
            warn!("malformed div request");
            return;
        };
        let mut dev = lock(&self.dev);
        let current = dev.channels_div();
        match payloads::div_decode(payload, &current, dev.chmax) {
            Ok(new) => {
                dev.update_div(&new);
                drop(dev);
                self.stats.push(SimEvent::Div(shape));
                self.send_ack();
            }
            Err(err) => warn!(%err, "div decode failed"),
        }
    }

    fn send_ack(&self) {
        if lock(&self.dev).flags.ack_supported() {
            let _ = self.tx.send(payloads::ack_reply(0).to_vec());
        }
    }

    fn stream_tick(&mut self) {
        let dev = lock(&self.dev).clone();
        let mut samples = Vec::new();
        {
            let mut gens = lock(&self.gens);
            for _ in 0..self.snum {
                for ch in dev.channels() {
                    if !ch.en {
                        continue;
                    }
                    let Some(slot) =
                        gens.get_mut(ch.chan as usize).and_then(Option::as_mut)
                    else {
                        continue;
                    };
                    if let Some(generated) = slot.get() {
                        samples.push(ChannelSample {
                            chan: ch.chan,
                            data: generated.data,
                            meta: generated.meta,
                        });
                    }
                }
            }
        }

        match stream_encode(StreamFlags::default(), &samples, &dev, &self.user) {
            Ok(Some(payload)) => {
                if let Ok(frame) = Frame::create(FrameId::Stream, &payload) {
                    let _ = self.tx.send(frame.to_vec());
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "stream encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use nxscope_proto::payloads::{ack_decode, cmninfo_decode};

    use super::*;

    #[test]
    fn answers_cmninfo_over_the_transport() {
        let sim = SimDevice::with_default_device();
        sim.start().unwrap();

        sim.write(&payloads::cmninfo_frame()).unwrap();
        let reply = Frame::decode(&sim.read()).unwrap();
        let info = cmninfo_decode(&reply).unwrap();
        assert_eq!(info.chmax, 10);
        assert_eq!(info.rxpadding, 16);

        sim.stop();
        assert_eq!(sim.stats().events(), vec![SimEvent::Cmninfo]);
    }

    #[test]
    fn applies_enable_and_acks() {
        let sim = SimDevice::with_default_device();
        sim.start().unwrap();

        let frame = payloads::enable_frame(
            &nxscope_proto::SetRequest::Single { chan: 2, value: true },
            10,
        )
        .unwrap();
        sim.write(&frame).unwrap();

        let ack = ack_decode(&Frame::decode(&sim.read()).unwrap()).unwrap();
        assert!(ack.ok());
        assert!(sim.device().channel(2).unwrap().en);

        sim.stop();
    }

    #[test]
    fn start_toggles_streaming() {
        let sim = SimDevice::with_default_device();
        sim.start().unwrap();

        sim.write(&payloads::start_frame(true)).unwrap();
        let _ack = sim.read();
        assert!(sim.streaming());

        sim.write(&payloads::start_frame(false)).unwrap();
        let _ack = sim.read();
        assert!(!sim.streaming());

        sim.stop();
    }

    #[test]
    fn tolerates_padded_writes() {
        let sim = SimDevice::with_default_device();
        sim.start().unwrap();
        sim.set_write_padding(16);

        sim.write_aligned(&payloads::cmninfo_frame()).unwrap();
        let reply = Frame::decode(&sim.read()).unwrap();
        assert!(cmninfo_decode(&reply).is_ok());

        sim.stop();
    }
}
