//! Core data types for the alert engine.

pub mod delivery;
pub mod market;
pub mod rule;
pub mod trigger;
pub mod user;

pub use delivery::*;
pub use market::*;
pub use rule::*;
pub use trigger::*;
pub use user::*;
