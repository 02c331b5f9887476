use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// 播放时钟 - 用于音视频同步
///
/// 读取时基于墙钟外推：`get_time() = time + elapsed * rate`
/// 所有读写都在同一把锁下完成，任何线程都不会观察到撕裂的更新
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    time: f64,              // 基准媒体时间（秒）
    last_wall: Instant,     // 基准墙钟时刻
    rate: f64,              // 播放速率（1.0 = 正常）
    position: i64,          // 字节偏移（仅供参考）
    paused: bool,
    paused_at: f64,         // 暂停时的位置
}

impl Clock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                time: 0.0,
                last_wall: Instant::now(),
                rate: 1.0,
                position: 0,
                paused: true,
                paused_at: 0.0,
            })),
        }
    }

    /// 获取当前播放时间（秒）
    pub fn get_time(&self) -> f64 {
        let inner = self.inner.lock();
        Self::now_unlocked(&inner)
    }

    /// 设置播放位置 - 重置墙钟锚点，外推永远从新鲜基准开始
    pub fn set_time(&self, seconds: f64) {
        let mut inner = self.inner.lock();
        inner.time = seconds;
        inner.last_wall = Instant::now();
        inner.paused_at = seconds;
    }

    /// 帧被消费时更新时钟（附带字节位置）
    pub fn update(&self, seconds: f64, position: i64) {
        let mut inner = self.inner.lock();
        inner.time = seconds;
        inner.last_wall = Instant::now();
        inner.paused_at = seconds;
        inner.position = position;
    }

    /// 开始走时
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.time = inner.paused_at;
            inner.last_wall = Instant::now();
            inner.paused = false;
        }
    }

    /// 暂停走时
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.paused_at = Self::now_unlocked(&inner);
            inner.paused = true;
        }
    }

    /// 设置播放速率
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            let current = Self::now_unlocked(&inner);
            inner.time = current;
            inner.last_wall = Instant::now();
        }
        inner.rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().rate
    }

    pub fn position(&self) -> i64 {
        self.inner.lock().position
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    fn now_unlocked(inner: &ClockInner) -> f64 {
        if inner.paused {
            inner.paused_at
        } else {
            let elapsed = inner.last_wall.elapsed().as_secs_f64();
            inner.time + elapsed * inner.rate
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// 主时钟选择 - 音频时钟优先，音频停摆时退回视频时钟
///
/// 音频停摆 = 没有启用的音频轨，或音频轨已播完
#[derive(Clone, Default)]
pub struct MasterClock {
    pub audio: Clock,
    pub video: Clock,
    audio_stalled: Arc<Mutex<bool>>,
}

impl MasterClock {
    pub fn new() -> Self {
        Self {
            audio: Clock::new(),
            video: Clock::new(),
            audio_stalled: Arc::new(Mutex::new(true)), // 音频轨就绪前先以视频为主
        }
    }

    /// 当前权威时钟
    pub fn main(&self) -> &Clock {
        if *self.audio_stalled.lock() {
            &self.video
        } else {
            &self.audio
        }
    }

    pub fn set_audio_stalled(&self, stalled: bool) {
        *self.audio_stalled.lock() = stalled;
    }

    pub fn is_audio_stalled(&self) -> bool {
        *self.audio_stalled.lock()
    }

    /// 两个时钟一起重定位（Seek 用）
    pub fn set_time(&self, seconds: f64) {
        self.audio.set_time(seconds);
        self.video.set_time(seconds);
    }

    pub fn play(&self) {
        self.audio.play();
        self.video.play();
    }

    pub fn pause(&self) {
        self.audio.pause();
        self.video.pause();
    }

    pub fn set_rate(&self, rate: f64) {
        self.audio.set_rate(rate);
        self.video.set_rate(rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_paused_holds_time() {
        let clock = Clock::new();
        clock.set_time(5.0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(clock.get_time(), 5.0);
    }

    #[test]
    fn test_clock_extrapolates_while_playing() {
        let clock = Clock::new();
        clock.set_time(1.0);
        clock.play();
        std::thread::sleep(Duration::from_millis(50));
        let t = clock.get_time();
        assert!(t > 1.0 && t < 2.0, "外推时间异常: {}", t);
    }

    #[test]
    fn test_master_clock_falls_back_to_video() {
        let master = MasterClock::new();
        master.audio.set_time(3.0);
        master.video.set_time(7.0);
        master.set_audio_stalled(false);
        assert_eq!(master.main().get_time(), 3.0);
        master.set_audio_stalled(true);
        assert_eq!(master.main().get_time(), 7.0);
    }
}
