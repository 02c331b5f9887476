use log::{debug, info};

/// 同步决策 - 对候选视频帧给出的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// 立即显示
    Present,
    /// 帧还没到时间，保持不取
    Hold,
    /// 丢弃 n 帧后再取下一帧
    DropFrames(usize),
    /// 清空整个帧队列
    FlushQueue,
    /// 丢弃下一个包（队列只剩一帧时不饿死显示端）
    DropNextPacket,
    /// 丢弃一个 GOP 的包
    DropGop,
    /// 落后太久，请求一次 Seek 追赶
    RequestSeek,
}

/// 音画同步策略
///
/// diff = 候选帧时间 - (主时钟时间 - 配置的视频延迟)
///
/// 策略刻意不对称：落后用丢帧/丢包甚至 Seek 激进纠正（音频连续性
/// 优先于视频流畅度），超前只温和等待。延迟计数器只在"准点"分支
/// 清零，单帧偶发迟到不会触发升级，持续迟到才会
pub struct SyncPolicy {
    video_delay: f64,   // 视频显示延迟补偿（秒）
    delay_count: u64,   // 连续迟到计数
    ahead_count: u64,   // 大幅超前时已放行的帧数
}

/// 超前超过该值视为一次性时钟毛刺
const LARGE_AHEAD_SECONDS: f64 = 8.0;
/// 落后超过该值进入 Seek 升级档
const SEEK_BEHIND_SECONDS: f64 = 8.0;
/// 落后超过该值进入丢 GOP / 清队列升级档
const HARD_BEHIND_SECONDS: f64 = 1.0;
/// 每 80 次深度迟到触发一次 Seek
const SEEK_ESCALATE_PERIOD: u64 = 80;
/// 每 10 次严重迟到触发一次丢 GOP / 清队列
const GOP_ESCALATE_PERIOD: u64 = 10;

impl SyncPolicy {
    pub fn new(video_delay: f64) -> Self {
        Self {
            video_delay,
            delay_count: 0,
            ahead_count: 0,
        }
    }

    /// 计算候选帧相对主时钟的偏差（秒）
    pub fn diff(&self, frame_seconds: f64, clock_seconds: f64) -> f64 {
        frame_seconds - (clock_seconds - self.video_delay)
    }

    /// 对候选视频帧做同步决策
    ///
    /// - `diff`: 候选帧时间相对主时钟的偏差（秒），正为超前
    /// - `fps`: 轨道标称帧率
    /// - `queue_len`: 帧队列当前深度
    pub fn decide(&mut self, diff: f64, fps: f64, queue_len: usize) -> SyncDecision {
        let fps = if fps > 0.0 { fps } else { 25.0 };
        let half_frame = 1.0 / (2.0 * fps);
        let late_threshold = -4.0 / fps;

        if diff > LARGE_AHEAD_SECONDS {
            // 大幅超前多半是一次性时钟毛刺：先放行约 fps/3 帧给时钟
            // 追赶的窗口，之后视为停摆开始 Hold
            let window = (fps / 3.0).ceil() as u64;
            if self.ahead_count < window {
                self.ahead_count += 1;
                debug!("🕐 大幅超前 {:.3}s，放行第 {}/{} 帧", diff, self.ahead_count, window);
                return SyncDecision::Present;
            }
            return SyncDecision::Hold;
        }

        if diff >= half_frame {
            // 帧在计划之前，等
            return SyncDecision::Hold;
        }

        if diff < late_threshold {
            // 帧落后于计划，升级式响应：既避免震荡又能在持续迟到时快速追上
            self.delay_count += 1;

            if diff < -SEEK_BEHIND_SECONDS && self.delay_count % SEEK_ESCALATE_PERIOD == 0 {
                info!("🕐 持续深度迟到 {:.3}s（第 {} 次），请求 Seek 追赶", diff, self.delay_count);
                return SyncDecision::RequestSeek;
            }

            if diff < -HARD_BEHIND_SECONDS && self.delay_count % GOP_ESCALATE_PERIOD == 0 {
                return if queue_len <= 1 {
                    info!("🕐 严重迟到 {:.3}s 且队列将空，丢弃一个 GOP 的包", diff);
                    SyncDecision::DropGop
                } else {
                    info!("🕐 严重迟到 {:.3}s，清空帧队列（{} 帧）", diff, queue_len);
                    SyncDecision::FlushQueue
                };
            }

            if queue_len <= 1 {
                // 只剩一帧时丢帧会饿死显示端，改丢上游的包
                return SyncDecision::DropNextPacket;
            }

            let drop = if self.delay_count == 1 {
                1 // 首次迟到只丢一帧
            } else {
                ((-diff) * fps / 4.0).floor().max(1.0) as usize
            };
            debug!("🕐 迟到 {:.3}s（第 {} 次），丢弃 {} 帧", diff, self.delay_count, drop);
            return SyncDecision::DropFrames(drop);
        }

        // 准点：唯一清零计数器的分支
        self.delay_count = 0;
        self.ahead_count = 0;
        SyncDecision::Present
    }

    /// Seek 后重置计数器
    pub fn reset(&mut self) {
        self.delay_count = 0;
        self.ahead_count = 0;
    }

    pub fn video_delay(&self) -> f64 {
        self.video_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FPS: f64 = 25.0;

    #[test]
    fn test_on_schedule_presents_and_resets() {
        let mut policy = SyncPolicy::new(0.0);
        assert_eq!(policy.decide(-0.5, FPS, 4), SyncDecision::DropFrames(1));
        assert_eq!(policy.decide(0.0, FPS, 4), SyncDecision::Present);
        // 清零后再次迟到又从首次迟到（丢 1 帧）开始
        assert_eq!(policy.decide(-0.5, FPS, 4), SyncDecision::DropFrames(1));
    }

    #[test]
    fn test_ahead_holds() {
        let mut policy = SyncPolicy::new(0.0);
        assert_eq!(policy.decide(0.5, FPS, 4), SyncDecision::Hold);
        assert_eq!(policy.decide(7.9, FPS, 4), SyncDecision::Hold);
    }

    #[test]
    fn test_large_ahead_allows_bounded_catchup_window() {
        let mut policy = SyncPolicy::new(0.0);
        let window = (FPS / 3.0).ceil() as usize;
        for _ in 0..window {
            assert_eq!(policy.decide(9.0, FPS, 4), SyncDecision::Present);
        }
        assert_eq!(policy.decide(9.0, FPS, 4), SyncDecision::Hold);
    }

    #[test]
    fn test_monotonic_escalation_never_regresses_to_present() {
        let mut policy = SyncPolicy::new(0.0);
        let mut seen_drop = false;
        let mut seen_gop_or_flush = false;
        let mut seen_seek = false;

        // 严格递增的落后幅度，中间没有任何准点帧
        for step in 0..200 {
            let diff = -1.5 - step as f64 * 0.1;
            match policy.decide(diff, FPS, 8) {
                SyncDecision::Present => {
                    panic!("严重落后时不允许回退到 Present (diff={})", diff)
                }
                SyncDecision::DropFrames(_) | SyncDecision::DropNextPacket => seen_drop = true,
                SyncDecision::DropGop | SyncDecision::FlushQueue => seen_gop_or_flush = true,
                SyncDecision::RequestSeek => {
                    seen_seek = true;
                    break;
                }
                SyncDecision::Hold => panic!("落后时不应 Hold (diff={})", diff),
            }
        }

        assert!(seen_drop, "升级链应先经过丢帧");
        assert!(seen_gop_or_flush, "升级链应经过丢 GOP / 清队列");
        assert!(seen_seek, "持续深度迟到最终应请求 Seek");
    }

    #[test]
    fn test_single_frame_queue_drops_packet_not_frame() {
        let mut policy = SyncPolicy::new(0.0);
        assert_eq!(policy.decide(-0.5, FPS, 1), SyncDecision::DropNextPacket);
    }

    #[test]
    fn test_video_delay_shifts_diff() {
        let policy = SyncPolicy::new(0.1);
        let diff = policy.diff(5.0, 5.0);
        assert!((diff - 0.1).abs() < 1e-9);
    }
}
