use serde::{Deserialize, Serialize};

use crate::core::MediaType;

/// Seek 模式
///
/// 时间定位是默认路径；字节定位对部分 TS 流会得到错误结果，
/// 必须由调用方显式开启并自行验证
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeekMode {
    Time,
    Byte,
}

impl Default for SeekMode {
    fn default() -> Self {
        SeekMode::Time
    }
}

/// 播放配置 - 构造时显式传入，不使用任何进程级全局开关
///
/// 作为 BufferingPolicy / SyncPolicy / Seek 协议的只读输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 前向缓冲目标（秒）- 轨道缓冲到此时长即判定可播
    pub forward_buffer_seconds: f64,

    /// 最大缓冲目标（秒）- 超过后暂停读线程，降到一半以下再恢复
    pub max_buffer_seconds: f64,

    /// 精确 Seek - 丢弃显示时间仍在目标之前的解码帧
    pub accurate_seek: bool,

    /// Seek 定位模式
    pub seek_mode: SeekMode,

    /// 循环播放（无缝衔接，走轨道的 loop model 路径）
    pub loop_play: bool,

    /// 音频同步解码（在调用线程解码，不开独立线程）
    pub audio_sync_decode: bool,

    /// 视频同步解码
    pub video_sync_decode: bool,

    /// 视频显示延迟补偿（秒）
    pub video_delay: f64,

    /// 帧队列默认容量（2 的幂）
    pub frame_queue_capacity: usize,

    /// 包队列默认容量（2 的幂）
    pub packet_queue_capacity: usize,

    /// 二次打开快速起播 - Seek/重开后音频包队列半满即可起播
    pub fast_start: bool,
}

impl PlayerConfig {
    /// 从 JSON 文本加载配置，缺省字段取默认值
    pub fn from_json(text: &str) -> crate::core::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::core::PlayerError::Other(format!("配置解析失败: {}", e)))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// 指定媒体类型是否启用同步解码
    pub fn sync_decode(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Audio => self.audio_sync_decode,
            MediaType::Video => self.video_sync_decode,
            MediaType::Subtitle => true, // 字幕量小，始终同步解码
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            forward_buffer_seconds: 3.0,
            max_buffer_seconds: 10.0,
            accurate_seek: false,
            seek_mode: SeekMode::Time,
            loop_play: false,
            audio_sync_decode: false,
            video_sync_decode: false,
            video_delay: 0.0,
            frame_queue_capacity: 16,
            packet_queue_capacity: 256,
            fast_start: false,
        }
    }
}
