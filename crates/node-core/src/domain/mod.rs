//! 노드 운영을 위한 도메인 모델.

mod asset;
mod command;
mod position;

pub use asset::*;
pub use command::*;
pub use position::*;
