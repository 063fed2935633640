//! Payment terminal drivers for the device abstraction layer.
//!
//! This crate connects the wire protocol in `dal-protocol` to physical (or
//! simulated) terminals and exposes them through one capability trait.
//!
//! # Layers
//!
//! ```text
//! CardDevice (traits) ──► AnyCardDevice (devices)
//!        │
//!        ├── VerifoneDevice (verifone) ──► Vipa (vipa) ──► VipaConnection (connection)
//!        │                                                   ├── writer: FramedWrite<VipaCodec>
//!        │                                                   └── reader task ──► ResponseCorrelator
//!        └── SimulatorDevice (simulator)
//! ```
//!
//! - [`connection`]: the half-duplex connection and the response correlator
//!   holding one pending completion per response kind.
//! - [`vipa`]: terminal commands (reset, abort, display, card status, manual
//!   PAN entry, HTML prompts, pre-swipe mode).
//! - [`verifone`] and [`simulator`]: the drivers.
//! - [`devices`]: enum dispatch over the drivers.
//! - `transport` (feature `serial`): opens a serial port for a Verifone
//!   terminal.
//!
//! # Async Traits
//!
//! [`CardDevice`] uses return-position `impl Future + Send`, so drivers write
//! plain `async fn` and callers can spawn the returned futures. The trait is
//! not object-safe; use [`AnyCardDevice`] for runtime selection.
//!
//! # Error Handling
//!
//! All operations return [`Result<T>`][error::Result] with [`HardwareError`].
//! Protocol faults from the lower crates convert into
//! [`HardwareError::Protocol`].
//!
//! # Examples
//!
//! ```
//! use dal_core::{DalRequest, DeviceAction};
//! use dal_hardware::{AnyCardDevice, CardDevice, SimulatorDevice};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> dal_hardware::Result<()> {
//!     let (simulator, _handle) = SimulatorDevice::new();
//!     let device = AnyCardDevice::from(simulator);
//!
//!     let request = DalRequest::for_action(DeviceAction::GetStatus);
//!     let request = device.get_status(request, CancellationToken::new()).await?;
//!     assert!(!request.has_errors());
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod devices;
pub mod error;
pub mod events;
pub mod simulator;
pub mod traits;
#[cfg(feature = "serial")]
pub mod transport;
pub mod types;
pub mod verifone;
pub mod vipa;

pub use connection::{Completion, DeviceReply, ReplyBody, ResponseCorrelator, VipaConnection};
pub use devices::AnyCardDevice;
pub use error::{HardwareError, Result};
pub use events::{EventPublisher, EventReceiver, event_channel};
pub use simulator::{SimulatedBehavior, SimulatorDevice, SimulatorHandle};
pub use traits::CardDevice;
pub use types::{CardPresence, DeviceKind, DeviceOperation, ResponseKind};
pub use verifone::{Reconnector, VerifoneDevice};
pub use vipa::Vipa;
