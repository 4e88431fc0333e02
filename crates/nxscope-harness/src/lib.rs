//! In-process simulated NxScope device.
//!
//! A contract mirror of the protocol for testing the host client without
//! hardware: [`SimDevice`] sits behind the client's transport seam,
//! answers the discovery handshake, applies configuration set-frames and
//! generates stream frames from per-channel [`gen::SignalGen`] sources.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nxscope_client::{ClientConfig, Nxscope};
//! use nxscope_harness::SimDevice;
//!
//! # fn main() -> Result<(), nxscope_client::ClientError> {
//! let sim = Arc::new(SimDevice::with_default_device());
//! let scope = Nxscope::new(sim.clone(), ClientConfig::default());
//! let device = scope.connect()?;
//! assert_eq!(device.chmax, 10);
//! # Ok(())
//! # }
//! ```

pub mod r#gen;
pub mod sim_device;

pub use r#gen::{GenData, SignalGen};
pub use sim_device::{
    GenSlots, SimDevice, SimDeviceConfig, SimEvent, SimStats, default_device,
};
