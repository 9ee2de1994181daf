//! Bluetooth Module
//!
//! Single-peripheral BLE GATT session management.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │     (one mutex domain, public API for the bridge)        │
//! └──────┬──────────────┬──────────────┬───────────────┬─────┘
//!        │              │              │               │
//!        ▼              ▼              ▼               ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐  ┌────────┐
//! │  Scanner  │  │ Connection │  │ Subscription │  │ Writer │
//! │           │  │  Session   │  │   Manager    │  │        │
//! └─────┬─────┘  └─────┬──────┘  └──────┬───────┘  └───┬────┘
//!       │              │  Resolver      │              │
//!       └──────────────┴───────┬────────┴──────────────┘
//!                              ▼
//!                    ┌───────────────────┐      NativeEvent
//!                    │    RadioStack     │ ───────────────────▶ dispatcher
//!                    └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - radio presence / power gate
//! - [`native`] - the radio-stack trait and its completion channel
//! - [`connection`] - session state machine and continuation slots
//! - [`resolver`] - attribute table lookups
//! - [`subscription`] - notify/indicate enablement
//! - [`writer`] - single in-flight characteristic write
//! - [`scanner`] - peripheral discovery
//! - [`events`] - event stream to the external listener
//! - [`service`] - main service coordinator
//! - [`protocol`] - UUIDs, CCCD values and address parsing
//! - [`fake`] - scripted in-memory radio stack
//! - `winrt` - Windows radio stack (Windows only)

pub mod adapter;
pub mod connection;
pub mod events;
pub mod fake;
pub mod native;
pub mod protocol;
pub mod resolver;
pub mod scanner;
pub mod service;
pub mod subscription;
pub mod writer;

#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BluetoothService;
