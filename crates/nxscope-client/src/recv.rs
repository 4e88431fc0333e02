//! Receive pipeline.
//!
//! A single worker thread turns the transport's byte stream into decoded
//! frames and routes them into two queues:
//!
//! - the **stream queue** for unsolicited STREAM frames, consumed by the
//!   stream dispatcher, and
//! - the **control queue** for everything else, consumed by the
//!   command/ACK layer's request/reply waits.
//!
//! Stream frames arrive continuously; keeping them out of the control
//! queue means they can never starve a short-lived request/reply
//! interaction, and a late ACK can never be mistaken for sample data.
//!
//! Corruption is handled by byte-level resync: garbage before the SOF
//! sentinel is dropped, and a frame that fails header or CRC validation
//! costs exactly one discarded byte before the scan restarts.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel::Sender;
use tracing::trace;

use nxscope_proto::{Frame, FrameHeader, FrameId, HDR_LEN, sof_find};

use crate::{transport::Transport, worker::WorkerJob};

/// Worker job feeding the control and stream queues from the transport.
pub(crate) struct RecvJob {
    transport: Arc<dyn Transport>,
    ctrl: Sender<Frame>,
    stream: Sender<Frame>,
    dev_ready: Arc<AtomicBool>,
    carry: Vec<u8>,
}

impl RecvJob {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        ctrl: Sender<Frame>,
        stream: Sender<Frame>,
        dev_ready: Arc<AtomicBool>,
    ) -> Self {
        Self { transport, ctrl, stream, dev_ready, carry: Vec::new() }
    }

    /// Top up the carry buffer to at least `target` bytes.
    ///
    /// Returns false as soon as a read comes back empty; the partial data
    /// stays in the buffer for the next iteration.
    fn fill(&mut self, target: usize) -> bool {
        while self.carry.len() < target {
            let data = self.transport.read();
            if data.is_empty() {
                return false;
            }
            self.carry.extend_from_slice(&data);
        }
        true
    }

    fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if !self.fill(HDR_LEN) {
                return None;
            }

            // drop garbage in front of the frame start
            match sof_find(&self.carry) {
                Some(0) => {}
                Some(at) => {
                    self.carry.drain(..at);
                    continue;
                }
                None => {
                    self.carry.clear();
                    return None;
                }
            }

            let hdr = match FrameHeader::decode(&self.carry) {
                Ok(hdr) => hdr,
                Err(err) => {
                    trace!(%err, "header resync");
                    self.carry.drain(..1);
                    continue;
                }
            };

            let flen = hdr.len as usize;
            if !self.fill(flen) {
                return None;
            }

            match Frame::decode(&self.carry[..flen]) {
                Ok(frame) => {
                    self.carry.drain(..flen);
                    return Some(frame);
                }
                Err(err) => {
                    // corrupted frame body: discard one byte and rescan
                    trace!(%err, "frame resync");
                    self.carry.drain(..1);
                }
            }
        }
    }

    fn route(&self, frame: Frame) {
        // send errors mean the session is tearing down; nothing to do
        if frame.id == FrameId::Stream {
            let _ = self.stream.send(frame);
        } else if frame.id == FrameId::Ack && !self.dev_ready.load(Ordering::Acquire) {
            // an ACK with no device record cannot be correlated; it
            // belongs to a request from before the handshake
            trace!("dropping ack received before device discovery");
        } else {
            let _ = self.ctrl.send(frame);
        }
    }
}

impl WorkerJob for RecvJob {
    fn run(&mut self) {
        if let Some(frame) = self.read_frame() {
            self.route(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crossbeam_channel::unbounded;

    use nxscope_proto::payloads;

    use super::*;
    use crate::error::Result;

    /// Transport stub replaying a fixed script of read chunks.
    struct Scripted {
        chunks: Mutex<VecDeque<Vec<u8>>>,
    }

    impl Scripted {
        fn new(chunks: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self { chunks: Mutex::new(chunks.into()) })
        }
    }

    impl Transport for Scripted {
        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn drop_all(&self) {}

        fn read(&self) -> Vec<u8> {
            self.chunks.lock().unwrap().pop_front().unwrap_or_default()
        }

        fn write(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn write_padding(&self) -> u8 {
            0
        }

        fn set_write_padding(&self, _padding: u8) {}
    }

    fn job_for(
        chunks: Vec<Vec<u8>>,
        dev_ready: bool,
    ) -> (RecvJob, crossbeam_channel::Receiver<Frame>, crossbeam_channel::Receiver<Frame>) {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (stream_tx, stream_rx) = unbounded();
        let job = RecvJob::new(
            Scripted::new(chunks),
            ctrl_tx,
            stream_tx,
            Arc::new(AtomicBool::new(dev_ready)),
        );
        (job, ctrl_rx, stream_rx)
    }

    fn drain(job: &mut RecvJob) {
        for _ in 0..64 {
            job.run();
        }
    }

    #[test]
    fn decodes_frame_split_across_reads() {
        let wire = payloads::cmninfo_frame().to_vec();
        let (head, tail) = wire.split_at(3);
        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![head.to_vec(), tail.to_vec()], true);

        drain(&mut job);
        let frame = ctrl_rx.try_recv().unwrap();
        assert_eq!(frame.id, FrameId::Cmninfo);
    }

    #[test]
    fn resyncs_after_leading_garbage() {
        let mut data = vec![0x00, 0x13, 0x37];
        data.extend_from_slice(&payloads::start_frame(true));
        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![data], true);

        drain(&mut job);
        let frame = ctrl_rx.try_recv().unwrap();
        assert_eq!(frame.id, FrameId::Start);
        assert!(ctrl_rx.try_recv().is_err());
    }

    #[test]
    fn resyncs_after_corrupted_frame() {
        // a frame with a broken CRC directly followed by a good one
        let mut bad = payloads::chinfo_frame(1).to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend_from_slice(&payloads::chinfo_frame(2));

        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![bad], true);
        drain(&mut job);

        let frame = ctrl_rx.try_recv().unwrap();
        assert_eq!(frame.payload.as_ref(), &[2]);
        assert!(ctrl_rx.try_recv().is_err());
    }

    #[test]
    fn embedded_frame_is_decoded_exactly_once() {
        // garbage containing a stray SOF, then a well-formed frame
        let mut data = vec![0x55, 0x01, 0x02];
        data.extend_from_slice(&payloads::cmninfo_frame());
        data.extend_from_slice(&[0xAA, 0xBB]);

        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![data], true);
        drain(&mut job);

        assert_eq!(ctrl_rx.try_recv().unwrap().id, FrameId::Cmninfo);
        assert!(ctrl_rx.try_recv().is_err());
    }

    #[test]
    fn stream_frames_go_to_the_stream_queue() {
        let stream = Frame::create(FrameId::Stream, &[0x00]).unwrap().to_vec();
        let ctrl = payloads::cmninfo_frame().to_vec();
        let (mut job, ctrl_rx, stream_rx) = job_for(vec![stream, ctrl], true);

        drain(&mut job);
        assert_eq!(stream_rx.try_recv().unwrap().id, FrameId::Stream);
        assert_eq!(ctrl_rx.try_recv().unwrap().id, FrameId::Cmninfo);
    }

    #[test]
    fn acks_are_dropped_until_device_is_known() {
        let ack = payloads::ack_reply(0).to_vec();
        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![ack.clone()], false);
        drain(&mut job);
        assert!(ctrl_rx.try_recv().is_err());

        let (mut job, ctrl_rx, _stream_rx) = job_for(vec![ack], true);
        drain(&mut job);
        assert_eq!(ctrl_rx.try_recv().unwrap().id, FrameId::Ack);
    }
}
