pub mod config;
mod error;
pub mod signaler;
pub mod transfer;

pub use error::TransferError;
pub use goconnect_shared::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
