use crate::core::{LoadingState, MediaType, PlayerConfig};

/// 单个轨道的缓冲占用快照 - 每次 tick 由轨道采集
#[derive(Debug, Clone)]
pub struct TrackOccupancy {
    pub media_type: MediaType,
    pub packet_count: usize,
    pub packet_capacity: usize,
    pub frame_count: usize,
    pub loaded_time: f64,   // 该轨道已缓冲时长（秒）
    pub is_end_of_file: bool,
    pub sync_decode: bool,
}

impl TrackOccupancy {
    /// 该轨道是否已"吃饱"
    ///
    /// 满足任一条件即可：
    /// - 已到 EOF（不会再有数据了）
    /// - 同步解码模式下已有 >= 2 帧在队
    /// - 首播/Seek 阶段启用快速起播时，音频包队列半满
    /// - 已缓冲时长达到前向缓冲目标
    fn is_satisfied(&self, forward_target: f64, is_first_or_seek: bool, fast_start: bool) -> bool {
        if self.is_end_of_file {
            return true;
        }
        if self.sync_decode && self.frame_count >= 2 {
            return true;
        }
        if is_first_or_seek
            && fast_start
            && self.media_type == MediaType::Audio
            && self.packet_count * 2 >= self.packet_capacity
        {
            return true;
        }
        self.loaded_time >= forward_target
    }
}

/// 缓冲策略 - 纯函数：轨道占用快照 -> LoadingState
///
/// loaded_time 取各轨道的最大值而不是最小值，避免某条轨道
/// 已经缓冲很远时整体判断仍过于保守
pub struct BufferingPolicy {
    forward_target: f64,
    max_target: f64,
    fast_start: bool,
}

impl BufferingPolicy {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            forward_target: config.forward_buffer_seconds,
            max_target: config.max_buffer_seconds,
            fast_start: config.fast_start,
        }
    }

    /// 重算缓冲状态
    pub fn evaluate(
        &self,
        tracks: &[TrackOccupancy],
        is_first: bool,
        is_seek: bool,
    ) -> LoadingState {
        if tracks.is_empty() {
            return LoadingState {
                is_first,
                is_seek,
                ..Default::default()
            };
        }

        let packet_count = tracks.iter().map(|t| t.packet_count).min().unwrap_or(0);
        let frame_count = tracks.iter().map(|t| t.frame_count).min().unwrap_or(0);
        let loaded_time = tracks.iter().map(|t| t.loaded_time).fold(0.0, f64::max);
        let is_end_of_file = tracks.iter().all(|t| t.is_end_of_file);

        let is_first_or_seek = is_first || is_seek;
        let is_playable = tracks
            .iter()
            .all(|t| t.is_satisfied(self.forward_target, is_first_or_seek, self.fast_start));

        let progress = if is_end_of_file {
            100
        } else {
            ((loaded_time / self.forward_target) * 100.0).min(100.0) as u32
        };

        LoadingState {
            loaded_time,
            progress,
            packet_count,
            frame_count,
            is_end_of_file,
            is_playable,
            is_first,
            is_seek,
        }
    }

    /// 读线程是否应当暂停（缓冲超过最大目标）
    pub fn should_pause_reader(&self, loaded_time: f64) -> bool {
        loaded_time > self.max_target
    }

    /// 已暂停的读线程是否可以恢复（降到最大目标一半以下）
    ///
    /// 与暂停阈值拉开一个迟滞带，避免在边界上反复切换
    pub fn should_resume_reader(&self, loaded_time: f64) -> bool {
        loaded_time < self.max_target / 2.0
    }
}
