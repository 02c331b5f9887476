use thiserror::Error;

/// 播放引擎错误
///
/// 分类与传播策略：
/// - 打开/读取错误是源级致命错误，直接让整个播放项进入 Failed
/// - 单包解码错误在轨道层吸收（记日志后跳过），不会停掉管线
/// - 轨道级致命错误只让该轨道 Failed；所有必需轨道都失败才上报
/// - Seek 失败只让本次 Seek 以失败完成，播放项保持 Reading
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("无法打开媒体源: {0}")]
    Open(String),

    #[error("读取数据包失败: {0}")]
    Read(String),

    #[error("解码错误: {0}")]
    Decode(String),

    #[error("Seek 失败: {0}")]
    Seek(String),

    #[error("缓冲区分配失败: {0}")]
    Allocation(String),

    #[error("找不到轨道: {0}")]
    NoTrack(usize),

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("播放项已关闭")]
    Closed,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 稳定错误码 - 通过事件通道上报给调用方
    pub fn code(&self) -> i32 {
        match self {
            PlayerError::Open(_) => 1,
            PlayerError::Read(_) => 2,
            PlayerError::Decode(_) => 3,
            PlayerError::Seek(_) => 4,
            PlayerError::Allocation(_) => 5,
            PlayerError::NoTrack(_) => 6,
            PlayerError::Unsupported(_) => 7,
            PlayerError::Closed => 8,
            PlayerError::Io(_) => 9,
            PlayerError::Other(_) => 100,
        }
    }

    /// 是否为源级致命错误（整个播放项 Failed）
    pub fn is_source_fatal(&self) -> bool {
        matches!(self, PlayerError::Open(_) | PlayerError::Read(_))
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
