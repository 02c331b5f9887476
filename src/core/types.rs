use serde::{Deserialize, Serialize};

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Subtitle,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Subtitle => "subtitle",
        }
    }
}

/// 时间基 - 每秒 tick 数的有理数表示
///
/// 流内时间戳都是以 tick 为单位的整数，必须通过时间基换算为秒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timebase {
    pub num: u32, // 分子（秒）
    pub den: u32, // 分母（tick）
}

impl Timebase {
    pub const MILLIS: Timebase = Timebase { num: 1, den: 1000 };

    pub fn new(num: u32, den: u32) -> Self {
        debug_assert!(num > 0 && den > 0, "时间基分子分母必须为正");
        Self { num, den }
    }

    /// tick -> 秒
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// 秒 -> tick
    pub fn from_seconds(&self, seconds: f64) -> i64 {
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Timebase::MILLIS
    }
}

/// 编码数据包 - 尚未解码的一段压缩数据
///
/// 一个包同一时刻只属于一个队列，pop/flush/shutdown 时被销毁
#[derive(Debug, Clone)]
pub struct CodedPacket {
    pub track_id: usize,        // 所属轨道 ID
    pub timestamp: i64,         // 时间戳（tick）
    pub duration: i64,          // 持续时间（tick）
    pub position: i64,          // 源内字节偏移
    pub size: usize,            // 字节大小
    pub is_key_frame: bool,     // 是否关键帧
    pub timebase: Timebase,
    pub data: Vec<u8>,          // 压缩数据（对引擎不透明）
}

impl CodedPacket {
    /// 时间戳换算为秒
    pub fn seconds(&self) -> f64 {
        self.timebase.to_seconds(self.timestamp)
    }

    /// 持续时间换算为秒
    pub fn duration_seconds(&self) -> f64 {
        self.timebase.to_seconds(self.duration)
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

/// 解码帧载荷（音频 | 视频 | 字幕）
#[derive(Debug, Clone)]
pub enum FramePayload {
    Audio {
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>, // 统一使用 f32 格式
    },
    Video {
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    },
    Subtitle {
        text: String,
        end_seconds: f64, // 结束显示时间（秒）
    },
}

/// 解码帧 - 可直接送显/送播的解码单元
///
/// 排序键为 `seconds()`（时间戳经时间基换算）
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: i64,     // 显示时间戳（tick）
    pub duration: i64,      // 持续时间（tick）
    pub position: i64,      // 源内字节偏移
    pub size: usize,        // 字节大小
    pub timebase: Timebase,
    pub is_key_frame: bool, // 是否来自关键帧（Seek 缓存命中需要）
    pub payload: FramePayload,
}

impl Frame {
    pub fn seconds(&self) -> f64 {
        self.timebase.to_seconds(self.timestamp)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.timebase.to_seconds(self.duration)
    }

    pub fn media_type(&self) -> MediaType {
        match self.payload {
            FramePayload::Audio { .. } => MediaType::Audio,
            FramePayload::Video { .. } => MediaType::Video,
            FramePayload::Subtitle { .. } => MediaType::Subtitle,
        }
    }
}

/// 轨道信息 - 打开媒体源后由源提供
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_id: usize,
    pub media_type: MediaType,
    pub is_enabled: bool,
    pub nominal_frame_rate: f64,    // 标称帧率（音频轨可视为包速率）
    pub frame_max_count: usize,     // 帧队列容量提示
    pub timebase: Timebase,
}

/// 缓冲状态 - 每次 tick 根据所有活跃轨道的占用情况重算，从不持久化
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadingState {
    pub loaded_time: f64,       // 已缓冲时长（秒，取各轨道最大值）
    pub progress: u32,          // 0 - 100
    pub packet_count: usize,    // 各轨道最小包数
    pub frame_count: usize,     // 各轨道最小帧数
    pub is_end_of_file: bool,
    pub is_playable: bool,
    pub is_first: bool,         // 首次起播阶段
    pub is_seek: bool,          // Seek 后重新缓冲阶段
}

/// 播放项状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Opened,
    Reading,
    Seeking,
    Paused,     // 缓冲已满，读线程挂起
    Finished,
    Failed,
    Closed,
}
