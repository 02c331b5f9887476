// 播放引擎核心 - 轨道缓冲与音画同步
//
// 不做解封装和解码本身：调用方通过 PacketSource / DecoderProvider
// 接入具体的容器与编解码后端，引擎负责缓冲、时钟与同步编排

pub mod core;
pub mod player;

pub use crate::core::{
    Clock, CodedPacket, Frame, FramePayload, LoadingState, MasterClock, MediaType, PlaybackState,
    PlayerConfig, PlayerError, Result, SeekMode, Timebase, TrackInfo,
};
pub use crate::player::{
    Decoder, DecoderProvider, PacketSource, PlayerEvent, PlayerItem, SeekTarget,
};
