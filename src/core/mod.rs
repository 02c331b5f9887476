// 核心数据结构和类型定义

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// 重新导出常用类型
pub use types::{CodedPacket, Frame, FramePayload};

pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;
