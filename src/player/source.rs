use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::core::{CodedPacket, Frame, PlayerError, Result, TrackInfo};

/// Seek 目标
///
/// 时间定位是默认路径；字节定位需要调用方显式开启（SeekMode::Byte），
/// 未经验证的源对字节定位可能给出错误结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    Seconds(f64),
    Bytes(i64),
}

/// 媒体源抽象接口（解封装协作方）
///
/// 打开 URL、产出带轨道 ID 与时间戳的编码包、上报 EOF 与 IO 错误。
/// 不同的媒体源（本地文件、网络流、内存流等）可以实现这个接口
pub trait PacketSource: Send {
    /// 读取下一个编码包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<CodedPacket>>;

    /// Seek 到指定位置
    fn seek(&mut self, target: SeekTarget) -> Result<()>;

    /// 轨道列表
    fn tracks(&self) -> Vec<TrackInfo>;

    /// 总时长（秒），直播流可为 0
    fn duration_seconds(&self) -> f64;

    /// 是否直播流（读取错误时重开源而不是直接判定致命）
    fn is_live(&self) -> bool {
        false
    }

    /// 重新打开源（直播流读错误重试路径）
    fn reopen(&mut self) -> Result<()> {
        Err(PlayerError::Unsupported("该媒体源不支持重开".to_string()))
    }

    /// 安装软中断标志 - 网络停摆时由编排方置位，源在 IO 调用粒度上检查
    fn set_interrupt(&mut self, _flag: Arc<AtomicBool>) {}

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 解码器能力接口（每轨道一个协作方）
///
/// 接收一个编码包，返回零个或多个解码帧
pub trait Decoder: Send {
    /// 解码一个包
    fn decode(&mut self, packet: &CodedPacket) -> Result<Vec<Frame>>;

    /// 丢弃解码器内部的待决状态（Seek 后调用）
    fn flush(&mut self);

    /// 释放解码器资源
    fn shutdown(&mut self);

    /// 是否硬件解码路径（失败回退判定用）
    fn is_hardware(&self) -> bool {
        false
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String {
        "decoder".to_string()
    }
}

/// 解码器工厂 - 按配置为轨道创建解码后端
///
/// 轨道重建（码率切换）与硬解回退都通过工厂重新取解码器，
/// 后端选择靠配置而不是继承层级
pub trait DecoderProvider: Send + Sync {
    /// 为轨道创建解码器（默认后端，可能是硬件路径）
    fn create(&self, track: &TrackInfo) -> Result<Box<dyn Decoder>>;

    /// 为轨道创建软件解码器（硬解反复失败后的一次性回退）
    fn create_software(&self, track: &TrackInfo) -> Result<Box<dyn Decoder>> {
        self.create(track)
    }
}
