//! Firmware types known to the analyses: GUIDs, service tables and their field layouts.

mod guid;
pub use guid::*;
mod known;
pub use known::*;
mod tables;
pub use tables::*;
mod services;
pub use services::*;
