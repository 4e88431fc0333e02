//! Per-channel signal generators for the simulated device.
//!
//! Each enabled channel of the simulator owns one generator; the stream
//! worker polls them every tick. A generator may skip a tick by returning
//! `None` (the text channel does this to emit sparse messages).

use nxscope_proto::SampleData;

/// One generated sample: data plus metadata values.
#[derive(Debug, Clone, PartialEq)]
pub struct GenData {
    /// Sample data matching the channel format
    pub data: SampleData,
    /// Metadata values matching the channel `mlen`
    pub meta: Vec<u64>,
}

impl GenData {
    /// Data-only sample with no metadata.
    #[must_use]
    pub fn new(data: SampleData) -> Self {
        Self { data, meta: Vec::new() }
    }
}

/// A channel data source.
pub trait SignalGen: Send {
    /// Reset internal state; called when the simulator (re)starts.
    fn reset(&mut self) {}

    /// Produce the next sample, or `None` to skip this tick.
    fn get(&mut self) -> Option<GenData>;
}

/// Uniform random scalar in `[0, 1)`.
#[derive(Debug, Default)]
pub struct RandomGen;

impl SignalGen for RandomGen {
    fn get(&mut self) -> Option<GenData> {
        Some(GenData::new(SampleData::Num(vec![rand::random::<f64>()])))
    }
}

/// Sawtooth ramp `0..=1000`.
#[derive(Debug, Default)]
pub struct SawtoothGen {
    cntr: i64,
}

impl SignalGen for SawtoothGen {
    fn reset(&mut self) {
        self.cntr = 0;
    }

    fn get(&mut self) -> Option<GenData> {
        self.cntr += 1;
        if self.cntr > 1000 {
            self.cntr = 0;
        }
        Some(GenData::new(SampleData::Num(vec![self.cntr as f64])))
    }
}

/// Triangle wave bouncing between -1000 and 1000.
#[derive(Debug)]
pub struct TriangleGen {
    cntr: i64,
    sign: i64,
}

impl Default for TriangleGen {
    fn default() -> Self {
        Self { cntr: 0, sign: 1 }
    }
}

impl SignalGen for TriangleGen {
    fn reset(&mut self) {
        self.cntr = 0;
        self.sign = 1;
    }

    fn get(&mut self) -> Option<GenData> {
        self.cntr += self.sign;
        if self.cntr > 1000 || self.cntr < -1000 {
            self.sign = -self.sign;
        }
        Some(GenData::new(SampleData::Num(vec![self.cntr as f64])))
    }
}

/// Random vector of a fixed dimension.
#[derive(Debug)]
pub struct RandomVectorGen {
    dim: usize,
}

impl RandomVectorGen {
    /// Generator producing `dim` random values per sample.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl SignalGen for RandomVectorGen {
    fn get(&mut self) -> Option<GenData> {
        let values = (0..self.dim).map(|_| rand::random::<f64>()).collect();
        Some(GenData::new(SampleData::Num(values)))
    }
}

/// Fixed vector emitted on every tick.
#[derive(Debug)]
pub struct ConstVectorGen {
    values: Vec<f64>,
}

impl ConstVectorGen {
    /// Generator always producing `values`.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl SignalGen for ConstVectorGen {
    fn get(&mut self) -> Option<GenData> {
        Some(GenData::new(SampleData::Num(self.values.clone())))
    }
}

/// Sparse text channel: emits a NUL-padded "hello" once every `period`
/// polls, starting with the first.
#[derive(Debug)]
pub struct TextGen {
    cntr: u64,
    period: u64,
    width: usize,
}

impl TextGen {
    /// Generator for a CHAR channel `width` bytes wide.
    #[must_use]
    pub fn new(period: u64, width: usize) -> Self {
        Self { cntr: 0, period, width }
    }
}

impl SignalGen for TextGen {
    fn reset(&mut self) {
        self.cntr = 0;
    }

    fn get(&mut self) -> Option<GenData> {
        let due = self.cntr % self.period == 0;
        self.cntr += 1;
        if !due {
            return None;
        }
        let mut text = String::from("hello");
        while text.len() < self.width {
            text.push('\0');
        }
        Some(GenData::new(SampleData::Chars(text)))
    }
}

/// Fixed vector with a wrapping counter in the metadata byte.
#[derive(Debug, Default)]
pub struct CountedMetaGen {
    cntr: u64,
}

impl SignalGen for CountedMetaGen {
    fn reset(&mut self) {
        self.cntr = 0;
    }

    fn get(&mut self) -> Option<GenData> {
        self.cntr = (self.cntr + 1) % 255;
        Some(GenData {
            data: SampleData::Num(vec![1.0, 0.0, -1.0]),
            meta: vec![self.cntr],
        })
    }
}

/// Metadata-only channel: no data, a fixed byte blob as metadata.
#[derive(Debug)]
pub struct MetaOnlyGen {
    blob: Vec<u64>,
}

impl MetaOnlyGen {
    /// Generator emitting `blob` (one value per metadata byte).
    #[must_use]
    pub fn new(blob: Vec<u64>) -> Self {
        Self { blob }
    }
}

impl SignalGen for MetaOnlyGen {
    fn get(&mut self) -> Option<GenData> {
        Some(GenData { data: SampleData::None, meta: self.blob.clone() })
    }
}
