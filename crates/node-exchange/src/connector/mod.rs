//! 거래소 커넥터.

pub mod bingx;
pub mod bybit;

pub use bingx::{BingxClient, BingxConfig};
pub use bybit::{BybitClient, BybitConfig};
