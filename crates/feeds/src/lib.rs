//! Market data adapters for the alert engine.
//!
//! ## Architecture
//!
//! - `provider` - The `MarketDataProvider` contract the engine consumes
//! - `rest` - HTTP adapter for a Polygon-compatible API
//! - `memory` - In-memory adapter with lookup counters (simulation, tests)

pub mod error;
pub mod memory;
pub mod provider;
pub mod rest;

pub use error::*;
pub use memory::*;
pub use provider::*;
pub use rest::*;
