// 播放管线：环形队列 -> 轨道（解码）-> 播放项（编排）
//
// 数据流向：
//   PacketSource (读线程) -> 轨道包队列 -> 解码 -> 帧队列 -> 调用方
//   缓冲策略与同步策略是纯决策层，不直接持有数据

pub mod buffering;
pub mod item;
pub mod ring_buffer;
pub mod source;
pub mod sync;
pub mod track;

pub use buffering::{BufferingPolicy, TrackOccupancy};
pub use item::{PlayerEvent, PlayerItem};
pub use ring_buffer::{QueueElement, RingBufferQueue};
pub use source::{Decoder, DecoderProvider, PacketSource, SeekTarget};
pub use sync::{SyncDecision, SyncPolicy};
pub use track::{PlayerTrack, TrackEvent, TrackState};
