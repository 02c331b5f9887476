use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::core::{
    Frame, LoadingState, MasterClock, MediaType, PlaybackState, PlayerConfig, PlayerError, Result,
    SeekMode, TrackInfo,
};
use crate::player::buffering::BufferingPolicy;
use crate::player::source::{DecoderProvider, PacketSource, SeekTarget};
use crate::player::sync::{SyncDecision, SyncPolicy};
use crate::player::track::{AsyncTrack, PlayerTrack, SyncTrack, TrackEvent, TrackState};

/// 播放项事件 - 通过通道异步上报给调用方
#[derive(Debug)]
pub enum PlayerEvent {
    /// 媒体源打开完成
    Opened { duration: f64 },
    /// 缓冲就绪，可以起播
    Playable,
    /// Seek 完成（cached 表示命中帧队列缓存，未重开源）
    SeekDone {
        seconds: f64,
        success: bool,
        cached: bool,
    },
    /// 单条轨道失败（播放项可能仍在继续）
    TrackFailed {
        track_id: usize,
        code: i32,
        description: String,
    },
    /// 全部轨道播放完成
    Finished,
    /// 播放项整体失败
    Failed { code: i32, description: String },
}

/// 发给读线程的命令
enum ReaderCommand {
    Seek(f64),
    Resume,
    Close,
}

/// 读线程暂停闸门
///
/// 缓冲超过上限时由 tick 侧关闸；读线程带超时等待，
/// 即便闸门关着也能周期性醒来检查命令通道
struct ReaderGate {
    paused: Mutex<bool>,
    cond: Condvar,
}

impl ReaderGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn pause(&self) {
        *self.paused.lock() = true;
    }

    fn resume(&self) {
        *self.paused.lock() = false;
        self.cond.notify_all();
    }

    /// 闸门关闭时最多等待 timeout，返回等待结束后闸门是否仍关闭
    fn wait_if_paused(&self, timeout: Duration) -> bool {
        let mut paused = self.paused.lock();
        if *paused {
            self.cond.wait_for(&mut paused, timeout);
        }
        *paused
    }
}

/// 播放项 - 单个媒体源的完整编排
///
/// 持有读线程、轨道集合、双时钟与缓冲/同步两套策略。
/// 调用方的驱动方式：
/// - 周期性调用 `tick()` 推进缓冲状态机并收割轨道事件
/// - 渲染端调用 `next_video_frame()` / `next_audio_frame()` 取帧，
///   消费后回调 `frame_presented()` 喂时钟
/// - 事件经 `events()` 通道异步送达
pub struct PlayerItem {
    config: PlayerConfig,
    provider: Arc<dyn DecoderProvider>,
    state: Arc<Mutex<PlaybackState>>,
    tracks: Arc<Mutex<Vec<Arc<PlayerTrack>>>>,
    clocks: MasterClock,
    buffering: BufferingPolicy,
    sync_policy: Mutex<SyncPolicy>,
    duration: f64,

    reader: Mutex<Option<JoinHandle<()>>>,
    command_tx: Sender<ReaderCommand>,
    reader_gate: Arc<ReaderGate>,
    interrupt: Arc<AtomicBool>,
    loop_pending: Arc<AtomicBool>,

    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    track_events_tx: Sender<TrackEvent>,
    track_events_rx: Receiver<TrackEvent>,

    is_first: AtomicBool,
    is_seek: AtomicBool,
    playable_sent: AtomicBool,
    finished_sent: AtomicBool,
}

impl PlayerItem {
    /// 打开媒体源并启动读线程
    pub fn open(
        mut source: Box<dyn PacketSource>,
        provider: Arc<dyn DecoderProvider>,
        config: PlayerConfig,
    ) -> Result<Self> {
        info!("🎬 打开媒体源: {}", source.description());
        let state = Arc::new(Mutex::new(PlaybackState::Opening));

        let interrupt = Arc::new(AtomicBool::new(false));
        source.set_interrupt(interrupt.clone());

        let (track_events_tx, track_events_rx) = unbounded();

        let mut tracks = Vec::new();
        let mut has_audio = false;
        for info in source.tracks().into_iter().filter(|i| i.is_enabled) {
            if info.media_type == MediaType::Audio {
                has_audio = true;
            }
            let track = build_track(&info, &config, provider.clone(), track_events_tx.clone())?;
            info!(
                "🎬 建立{}轨道 {} ({})",
                info.media_type.as_str(),
                info.track_id,
                if config.sync_decode(info.media_type) {
                    "同步解码"
                } else {
                    "异步解码"
                }
            );
            tracks.push(Arc::new(track));
        }
        if tracks.is_empty() {
            return Err(PlayerError::Open("媒体源没有启用的轨道".to_string()));
        }

        let duration = source.duration_seconds();
        let clocks = MasterClock::new();
        clocks.set_audio_stalled(!has_audio);

        *state.lock() = PlaybackState::Opened;
        let tracks = Arc::new(Mutex::new(tracks));
        let reader_gate = Arc::new(ReaderGate::new());
        let loop_pending = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();

        let reader = {
            let tracks = tracks.clone();
            let state = state.clone();
            let gate = reader_gate.clone();
            let events = events_tx.clone();
            let interrupt = interrupt.clone();
            let loop_pending = loop_pending.clone();
            let config = config.clone();
            thread::spawn(move || {
                reader_loop(
                    source,
                    tracks,
                    state,
                    gate,
                    command_rx,
                    events,
                    interrupt,
                    loop_pending,
                    config,
                )
            })
        };

        let _ = events_tx.send(PlayerEvent::Opened { duration });

        Ok(Self {
            sync_policy: Mutex::new(SyncPolicy::new(config.video_delay)),
            buffering: BufferingPolicy::new(&config),
            config,
            provider,
            state,
            tracks,
            clocks,
            duration,
            reader: Mutex::new(Some(reader)),
            command_tx,
            reader_gate,
            interrupt,
            loop_pending,
            events_tx,
            events_rx,
            track_events_tx,
            track_events_rx,
            is_first: AtomicBool::new(true),
            is_seek: AtomicBool::new(false),
            playable_sent: AtomicBool::new(false),
            finished_sent: AtomicBool::new(false),
        })
    }

    /// 事件通道（Opened / Playable / SeekDone / Finished / Failed ...）
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events_rx
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration
    }

    /// 当前播放位置（主时钟，秒）
    pub fn position_seconds(&self) -> f64 {
        self.clocks.main().get_time()
    }

    /// 各轨道码率估计之和（字节/秒，自适应码率信号）
    pub fn bitrate(&self) -> f64 {
        self.tracks.lock().iter().map(|t| t.bitrate()).sum()
    }

    pub fn play(&self) {
        self.clocks.play();
    }

    pub fn pause(&self) {
        self.clocks.pause();
    }

    pub fn set_rate(&self, rate: f64) {
        self.clocks.set_rate(rate);
    }

    /// 推进缓冲状态机一步
    ///
    /// 收割轨道事件、重算缓冲状态、驱动读线程的迟滞暂停/恢复，
    /// 返回本次快照
    pub fn tick(&self) -> LoadingState {
        self.drain_track_events();
        self.maybe_exit_loop_model();

        let tracks: Vec<_> = self.tracks.lock().iter().cloned().collect();
        for track in &tracks {
            track.poll_finish();
        }
        let occupancies: Vec<_> = tracks
            .iter()
            .filter(|t| t.state() != TrackState::Failed)
            .map(|t| t.occupancy(self.config.sync_decode(t.media_type())))
            .collect();

        let is_first = self.is_first.load(Ordering::SeqCst);
        let is_seek = self.is_seek.load(Ordering::SeqCst);
        let loading = self.buffering.evaluate(&occupancies, is_first, is_seek);

        if loading.is_playable {
            self.is_first.store(false, Ordering::SeqCst);
            self.is_seek.store(false, Ordering::SeqCst);
            if self
                .playable_sent
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                info!("✅ 缓冲就绪，可以起播（已缓冲 {:.2}s）", loading.loaded_time);
                let _ = self.events_tx.send(PlayerEvent::Playable);
            }
        }

        // 读线程迟滞暂停/恢复
        let state = *self.state.lock();
        match state {
            PlaybackState::Reading if self.buffering.should_pause_reader(loading.loaded_time) => {
                debug!("📦 缓冲 {:.2}s 超过上限，暂停读线程", loading.loaded_time);
                self.reader_gate.pause();
                *self.state.lock() = PlaybackState::Paused;
            }
            PlaybackState::Paused if self.buffering.should_resume_reader(loading.loaded_time) => {
                debug!("📦 缓冲降到 {:.2}s，恢复读线程", loading.loaded_time);
                self.reader_gate.resume();
                *self.state.lock() = PlaybackState::Reading;
                let _ = self.command_tx.send(ReaderCommand::Resume);
            }
            _ => {}
        }

        loading
    }

    /// Seek 到指定时间（秒）
    ///
    /// 先试帧队列缓存：所有轨道都能在已缓冲区间内定位（视频要求
    /// 关键帧）才算命中，命中时免重开源、免清队列；任何一条轨道
    /// 未命中则走完整路径 - 武装闩锁、打断阻塞 IO、交给读线程做
    /// 容器级 Seek。返回是否命中缓存
    pub fn seek(&self, seconds: f64) -> bool {
        let seconds = if self.duration > 0.0 {
            seconds.clamp(0.0, self.duration)
        } else {
            seconds.max(0.0)
        };
        info!("🎯 Seek 到 {:.3}s", seconds);

        {
            let mut state = self.state.lock();
            if *state == PlaybackState::Closed {
                warn!("⚠️ 播放项已关闭，忽略 Seek");
                return false;
            }
            if *state == PlaybackState::Failed {
                // Failed 不是终点：新的 Seek 重新拉起失败的轨道
                info!("🔄 从 Failed 状态重新拉起播放");
            }
            *state = PlaybackState::Seeking;
        }
        self.sync_policy.lock().reset();
        self.playable_sent.store(false, Ordering::SeqCst);
        self.finished_sent.store(false, Ordering::SeqCst);
        self.loop_pending.store(false, Ordering::SeqCst);

        let tracks: Vec<_> = self.tracks.lock().iter().cloned().collect();

        let mut hits = Vec::with_capacity(tracks.len());
        let mut all_hit = true;
        for track in &tracks {
            let need_key = track.media_type() == MediaType::Video;
            match track.frame_queue().seek(seconds, need_key) {
                Some((index, _time)) => hits.push((track.clone(), index)),
                None => {
                    all_hit = false;
                    break;
                }
            }
        }

        if all_hit && !tracks.is_empty() {
            // 定位到提交之间渲染端可能已把队头消费过定位点，
            // 提交失败就整体放弃缓存路径
            let mut committed = true;
            for (track, index) in &hits {
                if !track.frame_queue().update_head(*index) {
                    committed = false;
                    break;
                }
                track.commit_cached_seek(seconds);
            }
            if committed {
                self.clocks.set_time(seconds);
                *self.state.lock() = PlaybackState::Reading;
                // 读线程可能正被缓冲上限闸住，放行以免 Seek 后断供
                self.reader_gate.resume();
                info!("✅ Seek 缓存命中，免重开源");
                let _ = self.events_tx.send(PlayerEvent::SeekDone {
                    seconds,
                    success: true,
                    cached: true,
                });
                return true;
            }
            warn!("⚠️ Seek 缓存提交失败，改走完整路径");
        }

        // 完整路径：清队列重新缓冲
        self.is_seek.store(true, Ordering::SeqCst);
        for track in &tracks {
            track.arm_seek(seconds);
        }
        self.interrupt.store(true, Ordering::SeqCst);
        self.clocks.set_time(seconds);
        self.reader_gate.resume();
        if self.command_tx.send(ReaderCommand::Seek(seconds)).is_err() {
            // 读线程已退出（源级失败），无处执行容器 Seek
            error!("❌ 读线程已退出，Seek 无法执行");
            *self.state.lock() = PlaybackState::Failed;
            let _ = self.events_tx.send(PlayerEvent::SeekDone {
                seconds,
                success: false,
                cached: false,
            });
        }
        false
    }

    /// 取下一帧视频，按同步策略裁决
    pub fn next_video_frame(&self) -> Option<Frame> {
        let track = self.track_of(MediaType::Video)?;
        let fps = track.info().nominal_frame_rate;
        let queue = track.frame_queue();
        let clock = self.clocks.main().get_time();

        // 丢帧决策后最多再看两次候选帧，不无界循环
        for _ in 0..3 {
            let candidate = queue.front_seconds()?;
            let decision = {
                let mut policy = self.sync_policy.lock();
                let diff = policy.diff(candidate, clock);
                policy.decide(diff, fps, queue.len())
            };
            match decision {
                SyncDecision::Present => {
                    // 谓词防备并发消费端已把队头换掉
                    return queue.pop(
                        false,
                        Some(&|frame: &Frame, _| (frame.seconds() - candidate).abs() < 1e-9),
                    );
                }
                SyncDecision::Hold => return None,
                SyncDecision::DropFrames(n) => {
                    for _ in 0..n {
                        if queue.pop(false, None).is_none() {
                            break;
                        }
                    }
                }
                SyncDecision::FlushQueue => {
                    queue.flush();
                    return None;
                }
                SyncDecision::DropNextPacket => {
                    track.drop_next_packet();
                    return queue.pop(false, None);
                }
                SyncDecision::DropGop => {
                    track.drop_gop();
                    return queue.pop(false, None);
                }
                SyncDecision::RequestSeek => {
                    let target = self.clocks.main().get_time();
                    warn!("🕐 视频严重落后，Seek 到主时钟位置 {:.3}s 追赶", target);
                    self.seek(target);
                    return None;
                }
            }
        }
        None
    }

    /// 取下一帧音频（音频是主时钟，不做同步裁决）
    pub fn next_audio_frame(&self) -> Option<Frame> {
        let track = self.track_of(MediaType::Audio)?;
        track.frame_queue().pop(false, None)
    }

    /// 取到期的字幕帧（显示时间 <= 主时钟才出队）
    pub fn next_subtitle_frame(&self) -> Option<Frame> {
        let track = self.track_of(MediaType::Subtitle)?;
        let now = self.clocks.main().get_time();
        track
            .frame_queue()
            .pop(false, Some(&|frame: &Frame, _| frame.seconds() <= now))
    }

    /// 帧被实际消费（送显/送播）后回调，驱动对应时钟
    pub fn frame_presented(&self, frame: &Frame) {
        match frame.media_type() {
            MediaType::Audio => {
                self.clocks.audio.update(frame.seconds(), frame.position);
                self.clocks.set_audio_stalled(false);
            }
            MediaType::Video => {
                self.clocks.video.update(frame.seconds(), frame.position);
            }
            MediaType::Subtitle => {}
        }
    }

    /// 替换同 ID 轨道（码率切换）；无同 ID 轨道时新增
    pub fn replace_track(&self, info: TrackInfo) -> Result<()> {
        let track = Arc::new(build_track(
            &info,
            &self.config,
            self.provider.clone(),
            self.track_events_tx.clone(),
        )?);
        let old = {
            let mut tracks = self.tracks.lock();
            match tracks.iter_mut().find(|t| t.info().track_id == info.track_id) {
                Some(slot) => Some(std::mem::replace(slot, track)),
                None => {
                    tracks.push(track);
                    None
                }
            }
        };
        if let Some(old) = old {
            info!("🔄 替换轨道 {}（码率切换）", info.track_id);
            old.close();
        }
        Ok(())
    }

    /// 关闭播放项（幂等）
    ///
    /// 顺序：置状态 -> 打断 IO -> 关轨道队列（解除读线程的背压
    /// 阻塞）-> 收读线程 -> 收各轨道解码线程
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == PlaybackState::Closed {
                return;
            }
            *state = PlaybackState::Closed;
        }
        info!("🗑️ 关闭播放项");

        self.interrupt.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(ReaderCommand::Close);
        self.reader_gate.resume();

        let tracks: Vec<_> = self.tracks.lock().drain(..).collect();
        for track in &tracks {
            track.close();
        }
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
        info!("✅ 播放项已关闭");
    }

    fn track_of(&self, media_type: MediaType) -> Option<Arc<PlayerTrack>> {
        self.tracks
            .lock()
            .iter()
            .find(|t| t.media_type() == media_type && t.state() != TrackState::Failed)
            .cloned()
    }

    /// 收割轨道事件通道
    fn drain_track_events(&self) {
        while let Ok(event) = self.track_events_rx.try_recv() {
            match event {
                TrackEvent::Failed { track_id, error } => {
                    warn!("⚠️ 轨道 {} 失败: {}", track_id, error);
                    let _ = self.events_tx.send(PlayerEvent::TrackFailed {
                        track_id,
                        code: error.code(),
                        description: error.to_string(),
                    });
                    self.after_track_failure();
                }
                TrackEvent::Finished { track_id } => {
                    debug!("🏁 轨道 {} 播放完成", track_id);
                    self.refresh_audio_stall();
                    self.maybe_finish();
                }
            }
        }
    }

    fn after_track_failure(&self) {
        self.refresh_audio_stall();
        let all_failed = self
            .tracks
            .lock()
            .iter()
            .all(|t| t.state() == TrackState::Failed);
        if all_failed {
            let error = PlayerError::Decode("所有轨道都已失败".to_string());
            error!("❌ {}，播放项进入 Failed", error);
            *self.state.lock() = PlaybackState::Failed;
            let _ = self.events_tx.send(PlayerEvent::Failed {
                code: error.code(),
                description: error.to_string(),
            });
        }
    }

    /// 音频轨不可用（失败/播完/不存在）时主时钟退回视频
    fn refresh_audio_stall(&self) {
        let audio_alive = self.tracks.lock().iter().any(|t| {
            t.media_type() == MediaType::Audio
                && !matches!(
                    t.state(),
                    TrackState::Failed | TrackState::Finished | TrackState::Closed
                )
        });
        self.clocks.set_audio_stalled(!audio_alive);
    }

    fn maybe_finish(&self) {
        let all_done = self.tracks.lock().iter().all(|t| {
            matches!(
                t.state(),
                TrackState::Finished | TrackState::Failed | TrackState::Closed
            )
        });
        if all_done
            && self
                .finished_sent
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!("🏁 全部轨道播放完成");
            *self.state.lock() = PlaybackState::Finished;
            let _ = self.events_tx.send(PlayerEvent::Finished);
        }
    }

    /// 循环绕回后的退出判定
    ///
    /// 现役包队列与帧队列都耗尽的轨道逐个并入备用包（帧队列按时间
    /// 戳排序，必须清空后再并入，绕回的低时间戳帧才不会插到队头）。
    /// 全部轨道退出后把时钟重锚到起点
    fn maybe_exit_loop_model(&self) {
        if !self.loop_pending.load(Ordering::SeqCst) {
            return;
        }
        let tracks: Vec<_> = self.tracks.lock().iter().cloned().collect();
        let mut any_active = false;
        for track in &tracks {
            if !track.is_loop_model() {
                continue;
            }
            if track.packet_count() == 0 && track.frame_queue().is_empty() {
                track.set_loop_model(false);
            } else {
                any_active = true;
            }
        }
        if !any_active {
            self.loop_pending.store(false, Ordering::SeqCst);
            self.sync_policy.lock().reset();
            self.clocks.set_time(0.0);
            info!("🔁 循环绕回完成，时钟重锚到起点");
        }
    }
}

impl Drop for PlayerItem {
    fn drop(&mut self) {
        self.close();
    }
}

/// 按配置为轨道选择同步/异步流水线
fn build_track(
    info: &TrackInfo,
    config: &PlayerConfig,
    provider: Arc<dyn DecoderProvider>,
    events: Sender<TrackEvent>,
) -> Result<PlayerTrack> {
    let decoder = provider.create(info)?;
    let frame_capacity = if info.frame_max_count > 0 {
        info.frame_max_count
    } else {
        config.frame_queue_capacity
    };
    let track = if config.sync_decode(info.media_type) {
        PlayerTrack::Sync(SyncTrack::new(
            info.clone(),
            frame_capacity,
            config.accurate_seek,
            decoder,
            provider,
            events,
        ))
    } else {
        PlayerTrack::Async(AsyncTrack::new(
            info.clone(),
            config.packet_queue_capacity,
            frame_capacity,
            config.accurate_seek,
            decoder,
            provider,
            events,
        ))
    };
    Ok(track)
}

/// 读线程主循环
///
/// 每轮：排空命令（多个 Seek 合并为最后一个）-> 过暂停闸门 ->
/// 读一个包投递到对应轨道。投递在轨道包队列满时阻塞，
/// 这是 demux 侧的天然背压
#[allow(clippy::too_many_arguments)]
fn reader_loop(
    mut source: Box<dyn PacketSource>,
    tracks: Arc<Mutex<Vec<Arc<PlayerTrack>>>>,
    state: Arc<Mutex<PlaybackState>>,
    gate: Arc<ReaderGate>,
    commands: Receiver<ReaderCommand>,
    events: Sender<PlayerEvent>,
    interrupt: Arc<AtomicBool>,
    loop_pending: Arc<AtomicBool>,
    config: PlayerConfig,
) {
    info!("🧵 [读线程] 启动: {}", source.description());
    let enter = |next: PlaybackState| {
        let mut state = state.lock();
        if *state != PlaybackState::Closed {
            *state = next;
        }
    };
    enter(PlaybackState::Reading);
    let mut eof_reached = false;

    'outer: loop {
        // 排空命令通道，Seek 只保留最后一个
        let mut pending_seek: Option<f64> = None;
        loop {
            match commands.try_recv() {
                Ok(ReaderCommand::Seek(seconds)) => pending_seek = Some(seconds),
                Ok(ReaderCommand::Resume) => {}
                Ok(ReaderCommand::Close) => break 'outer,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        if let Some(seconds) = pending_seek {
            interrupt.store(false, Ordering::SeqCst);
            let target = match config.seek_mode {
                SeekMode::Time => SeekTarget::Seconds(seconds),
                SeekMode::Byte => {
                    // 用码率估算字节偏移；码率未知时退回时间定位
                    let rate: f64 = tracks.lock().iter().map(|t| t.bitrate()).sum();
                    if rate > 0.0 {
                        SeekTarget::Bytes((seconds * rate) as i64)
                    } else {
                        SeekTarget::Seconds(seconds)
                    }
                }
            };
            match source.seek(target) {
                Ok(()) => {
                    info!("🎯 [读线程] 容器 Seek 到 {:.3}s 完成", seconds);
                    eof_reached = false;
                    enter(PlaybackState::Reading);
                    let _ = events.send(PlayerEvent::SeekDone {
                        seconds,
                        success: true,
                        cached: false,
                    });
                }
                Err(e) => {
                    // Seek 失败不致命：保持当前读取位置继续
                    warn!("⚠️ [读线程] 容器 Seek 失败: {}", e);
                    enter(PlaybackState::Reading);
                    let _ = events.send(PlayerEvent::SeekDone {
                        seconds,
                        success: false,
                        cached: false,
                    });
                }
            }
            continue;
        }

        if gate.wait_if_paused(Duration::from_millis(50)) {
            continue;
        }

        if eof_reached {
            // 等 Seek 或 Close
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        match source.read_packet() {
            Ok(Some(packet)) => {
                // 把轨道 Arc 拿出锁再投递：put_packet 可能因背压长时间阻塞
                let track = {
                    let tracks = tracks.lock();
                    tracks
                        .iter()
                        .find(|t| t.info().track_id == packet.track_id)
                        .cloned()
                };
                if let Some(track) = track {
                    track.put_packet(packet);
                }
            }
            Ok(None) => {
                if config.loop_play && loop_pending.load(Ordering::SeqCst) {
                    // 备用缓冲已存满一整轮，等编排方并入后再绕回
                    thread::sleep(Duration::from_millis(20));
                    continue;
                }
                info!("🏁 [读线程] 源到达 EOF");
                let snapshot: Vec<_> = tracks.lock().iter().cloned().collect();
                if config.loop_play {
                    // 无缝循环：轨道进 loop model，绕回起点继续读
                    for track in &snapshot {
                        track.set_loop_model(true);
                    }
                    match source.seek(SeekTarget::Seconds(0.0)) {
                        Ok(()) => {
                            info!("🔁 [读线程] 循环绕回起点");
                            loop_pending.store(true, Ordering::SeqCst);
                            continue;
                        }
                        Err(e) => warn!("⚠️ [读线程] 循环绕回失败: {}", e),
                    }
                }
                for track in &snapshot {
                    track.on_eof();
                }
                eof_reached = true;
            }
            Err(e) => {
                if source.is_live() {
                    warn!("⚠️ [读线程] 直播源读取失败，尝试重开: {}", e);
                    if source.reopen().is_ok() {
                        continue;
                    }
                }
                error!("❌ [读线程] 读取失败: {}", e);
                enter(PlaybackState::Failed);
                let _ = events.send(PlayerEvent::Failed {
                    code: e.code(),
                    description: e.to_string(),
                });
                break;
            }
        }
    }

    info!("🧵 [读线程] 退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CodedPacket, FramePayload, PixelFormat, Timebase};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// 脚本化媒体源：预生成的包序列 + Seek/读取计数
    struct ScriptedSource {
        packets: Vec<CodedPacket>,
        cursor: usize,
        infos: Vec<TrackInfo>,
        duration: f64,
        seek_calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(infos: Vec<TrackInfo>, packets: Vec<CodedPacket>, duration: f64) -> Self {
            Self {
                packets,
                cursor: 0,
                infos,
                duration,
                seek_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PacketSource for ScriptedSource {
        fn read_packet(&mut self) -> Result<Option<CodedPacket>> {
            match self.packets.get(self.cursor) {
                Some(packet) => {
                    self.cursor += 1;
                    Ok(Some(packet.clone()))
                }
                None => Ok(None),
            }
        }

        fn seek(&mut self, target: SeekTarget) -> Result<()> {
            self.seek_calls.fetch_add(1, Ordering::SeqCst);
            let seconds = match target {
                SeekTarget::Seconds(s) => s,
                SeekTarget::Bytes(_) => {
                    return Err(PlayerError::Unsupported("字节定位".to_string()))
                }
            };
            self.cursor = self
                .packets
                .iter()
                .position(|p| p.seconds() >= seconds)
                .unwrap_or(self.packets.len());
            Ok(())
        }

        fn tracks(&self) -> Vec<TrackInfo> {
            self.infos.clone()
        }

        fn duration_seconds(&self) -> f64 {
            self.duration
        }

        fn description(&self) -> String {
            "scripted".to_string()
        }
    }

    struct PassDecoder {
        media_type: MediaType,
    }

    impl crate::player::source::Decoder for PassDecoder {
        fn decode(&mut self, packet: &CodedPacket) -> Result<Vec<Frame>> {
            let payload = match self.media_type {
                MediaType::Audio => FramePayload::Audio {
                    sample_rate: 48_000,
                    channels: 2,
                    samples: Vec::new(),
                },
                MediaType::Video => FramePayload::Video {
                    width: 16,
                    height: 16,
                    format: PixelFormat::RGBA,
                    data: Vec::new(),
                },
                MediaType::Subtitle => FramePayload::Subtitle {
                    text: String::new(),
                    end_seconds: packet.seconds() + 1.0,
                },
            };
            Ok(vec![Frame {
                timestamp: packet.timestamp,
                duration: packet.duration,
                position: packet.position,
                size: packet.size,
                timebase: packet.timebase,
                is_key_frame: packet.is_key_frame,
                payload,
            }])
        }

        fn flush(&mut self) {}

        fn shutdown(&mut self) {}
    }

    struct PassProvider;

    impl DecoderProvider for PassProvider {
        fn create(&self, track: &TrackInfo) -> Result<Box<dyn crate::player::source::Decoder>> {
            Ok(Box::new(PassDecoder {
                media_type: track.media_type,
            }))
        }
    }

    /// 单音频轨的测试源：10 包/秒，每包都是"关键帧"
    fn audio_source(duration: f64, frame_max_count: usize) -> ScriptedSource {
        let info = TrackInfo {
            track_id: 1,
            media_type: MediaType::Audio,
            is_enabled: true,
            nominal_frame_rate: 10.0,
            frame_max_count,
            timebase: Timebase::MILLIS,
        };
        let count = (duration * 10.0) as i64;
        let packets = (0..count)
            .map(|i| CodedPacket {
                track_id: 1,
                timestamp: i * 100,
                duration: 100,
                position: i * 1000,
                size: 1000,
                is_key_frame: true,
                timebase: Timebase::MILLIS,
                data: Vec::new(),
            })
            .collect();
        ScriptedSource::new(vec![info], packets, duration)
    }

    /// 驱动 tick 直到出现满足谓词的事件
    fn pump_until<F: Fn(&PlayerEvent) -> bool>(item: &PlayerItem, pred: F) -> PlayerEvent {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            item.tick();
            if let Ok(event) = item.events().recv_timeout(Duration::from_millis(10)) {
                if pred(&event) {
                    return event;
                }
            }
            assert!(Instant::now() < deadline, "等待事件超时");
        }
    }

    #[test]
    fn test_open_reports_duration_and_starts_reading() {
        let source = audio_source(10.0, 64);
        let item = PlayerItem::open(
            Box::new(source),
            Arc::new(PassProvider),
            PlayerConfig::default(),
        )
        .unwrap();
        match item.events().recv_timeout(Duration::from_secs(1)).unwrap() {
            PlayerEvent::Opened { duration } => assert_eq!(duration, 10.0),
            other => panic!("预期 Opened，收到 {:?}", other),
        }
        assert_eq!(item.duration_seconds(), 10.0);
        item.close();
    }

    #[test]
    fn test_playable_after_forward_buffer_reached() {
        let source = audio_source(10.0, 64);
        let item = PlayerItem::open(
            Box::new(source),
            Arc::new(PassProvider),
            PlayerConfig::default(), // 前向缓冲目标 3s
        )
        .unwrap();
        pump_until(&item, |e| matches!(e, PlayerEvent::Playable));
        let loading = item.tick();
        assert!(loading.loaded_time >= 3.0, "loaded = {}", loading.loaded_time);
        item.close();
    }

    #[test]
    fn test_finished_sent_exactly_once() {
        let source = audio_source(1.0, 64);
        let mut config = PlayerConfig::default();
        config.audio_sync_decode = true; // 读线程就地解码，无需排空包队列
        let item =
            PlayerItem::open(Box::new(source), Arc::new(PassProvider), config).unwrap();

        pump_until(&item, |e| matches!(e, PlayerEvent::Finished));
        assert_eq!(item.state(), PlaybackState::Finished);

        // 再 tick 若干轮，不允许出现第二个 Finished
        for _ in 0..20 {
            item.tick();
        }
        while let Ok(event) = item.events().try_recv() {
            assert!(
                !matches!(event, PlayerEvent::Finished),
                "Finished 事件重复发送"
            );
        }
        item.close();
    }

    #[test]
    fn test_cached_seek_skips_container_seek() {
        let source = audio_source(8.0, 128);
        let seek_calls = source.seek_calls.clone();
        let mut config = PlayerConfig::default();
        config.audio_sync_decode = true; // 全部 80 帧直接进帧队列（容量 128）
        let item =
            PlayerItem::open(Box::new(source), Arc::new(PassProvider), config).unwrap();

        pump_until(&item, |e| matches!(e, PlayerEvent::Playable));
        // 等读线程把整个源读完，保证目标在缓冲区间内
        let deadline = Instant::now() + Duration::from_secs(3);
        while item.tick().loaded_time < 7.9 {
            assert!(Instant::now() < deadline, "缓冲未覆盖目标");
            thread::sleep(Duration::from_millis(5));
        }

        let cached = item.seek(5.0);
        assert!(cached, "目标在缓冲区间内，应命中缓存");
        assert_eq!(seek_calls.load(Ordering::SeqCst), 0, "不应触发容器 Seek");
        assert!((item.position_seconds() - 5.0).abs() < 0.05);

        match pump_until(&item, |e| matches!(e, PlayerEvent::SeekDone { .. })) {
            PlayerEvent::SeekDone { seconds, success, cached } => {
                assert_eq!(seconds, 5.0);
                assert!(success);
                assert!(cached);
            }
            _ => unreachable!(),
        }

        // 缓存提交后队头就是目标位置的帧
        let frame = item.next_audio_frame().expect("应有帧");
        assert!((frame.seconds() - 5.0).abs() < 0.11, "队头 = {}", frame.seconds());
        item.close();
    }

    #[test]
    fn test_seek_cache_miss_falls_back_to_container() {
        let source = audio_source(10.0, 16);
        let seek_calls = source.seek_calls.clone();
        let item = PlayerItem::open(
            Box::new(source),
            Arc::new(PassProvider),
            PlayerConfig::default(),
        )
        .unwrap();
        pump_until(&item, |e| matches!(e, PlayerEvent::Playable));

        // 帧队列只有 16 帧（1.6s），9.0s 必然在缓冲区间外
        let cached = item.seek(9.0);
        assert!(!cached);
        match pump_until(&item, |e| matches!(e, PlayerEvent::SeekDone { .. })) {
            PlayerEvent::SeekDone { seconds, success, cached } => {
                assert_eq!(seconds, 9.0);
                assert!(success);
                assert!(!cached);
            }
            _ => unreachable!(),
        }
        assert!(seek_calls.load(Ordering::SeqCst) >= 1);
        item.close();
    }

    /// 无尽音频源：按序合成包，永不 EOF（10 包/秒）
    struct EndlessAudioSource {
        next: i64,
    }

    impl PacketSource for EndlessAudioSource {
        fn read_packet(&mut self) -> Result<Option<CodedPacket>> {
            let packet = CodedPacket {
                track_id: 1,
                timestamp: self.next * 100,
                duration: 100,
                position: self.next * 1000,
                size: 1000,
                is_key_frame: true,
                timebase: Timebase::MILLIS,
                data: Vec::new(),
            };
            self.next += 1;
            // 合成源没有 IO 开销，稍作节流
            thread::sleep(Duration::from_micros(200));
            Ok(Some(packet))
        }

        fn seek(&mut self, target: SeekTarget) -> Result<()> {
            match target {
                SeekTarget::Seconds(s) => {
                    self.next = (s * 10.0) as i64;
                    Ok(())
                }
                SeekTarget::Bytes(_) => Err(PlayerError::Unsupported("字节定位".to_string())),
            }
        }

        fn tracks(&self) -> Vec<TrackInfo> {
            vec![TrackInfo {
                track_id: 1,
                media_type: MediaType::Audio,
                is_enabled: true,
                nominal_frame_rate: 10.0,
                frame_max_count: 64,
                timebase: Timebase::MILLIS,
            }]
        }

        fn duration_seconds(&self) -> f64 {
            0.0 // 时长未知
        }

        fn description(&self) -> String {
            "endless".to_string()
        }
    }

    /// 可修复解码器：healed 置位前全部解码失败
    struct FlakyDecoder {
        healed: Arc<AtomicBool>,
    }

    impl crate::player::source::Decoder for FlakyDecoder {
        fn decode(&mut self, packet: &CodedPacket) -> Result<Vec<Frame>> {
            if !self.healed.load(Ordering::SeqCst) {
                return Err(PlayerError::Decode("解码器未就绪".to_string()));
            }
            Ok(vec![Frame {
                timestamp: packet.timestamp,
                duration: packet.duration,
                position: packet.position,
                size: packet.size,
                timebase: packet.timebase,
                is_key_frame: packet.is_key_frame,
                payload: FramePayload::Audio {
                    sample_rate: 48_000,
                    channels: 2,
                    samples: Vec::new(),
                },
            }])
        }

        fn flush(&mut self) {}

        fn shutdown(&mut self) {}
    }

    struct FlakyProvider {
        healed: Arc<AtomicBool>,
    }

    impl DecoderProvider for FlakyProvider {
        fn create(&self, _track: &TrackInfo) -> Result<Box<dyn crate::player::source::Decoder>> {
            Ok(Box::new(FlakyDecoder {
                healed: self.healed.clone(),
            }))
        }
    }

    #[test]
    fn test_cached_seek_while_reader_paused_resumes_reading() {
        let source = audio_source(100.0, 64);
        let mut config = PlayerConfig::default();
        config.audio_sync_decode = true;
        config.max_buffer_seconds = 4.0; // 读线程很快被缓冲上限闸住
        let item =
            PlayerItem::open(Box::new(source), Arc::new(PassProvider), config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while item.state() != PlaybackState::Paused {
            item.tick();
            assert!(Instant::now() < deadline, "读线程未被缓冲上限暂停");
            thread::sleep(Duration::from_millis(5));
        }

        // 闸门关着时 Seek 到缓冲区间靠后的位置：命中缓存，丢掉大半
        // 缓冲后水位低于暂停线，tick 的迟滞分支不会再碰闸门，
        // Seek 自己必须放行读线程
        let cached = item.seek(5.0);
        assert!(cached, "目标在缓冲区间内，应命中缓存");
        assert_eq!(item.state(), PlaybackState::Reading);

        // 取到远超残余缓冲的帧，证明读线程恢复了供包
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            item.tick();
            if let Some(frame) = item.next_audio_frame() {
                if frame.seconds() >= 9.0 {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "Seek 后读线程未恢复读取");
            thread::sleep(Duration::from_millis(5));
        }
        item.close();
    }

    #[test]
    fn test_seek_rearms_failed_item_after_decoder_recovers() {
        let healed = Arc::new(AtomicBool::new(false));
        let mut config = PlayerConfig::default();
        config.audio_sync_decode = true;
        let item = PlayerItem::open(
            Box::new(EndlessAudioSource { next: 0 }),
            Arc::new(FlakyProvider {
                healed: healed.clone(),
            }),
            config,
        )
        .unwrap();

        // 连续解码失败打满阈值，唯一轨道失败，播放项整体 Failed
        pump_until(&item, |e| matches!(e, PlayerEvent::Failed { .. }));
        assert_eq!(item.state(), PlaybackState::Failed);

        // 源还活着，解码器恢复后新的 Seek 必须能重新拉起播放
        healed.store(true, Ordering::SeqCst);
        let cached = item.seek(0.0);
        assert!(!cached);
        match pump_until(&item, |e| matches!(e, PlayerEvent::SeekDone { .. })) {
            PlayerEvent::SeekDone { success, cached, .. } => {
                assert!(success);
                assert!(!cached);
            }
            _ => unreachable!(),
        }
        // 轨道重新出帧即证明拉起成功
        pump_frame(&item);
        assert_ne!(item.state(), PlaybackState::Failed);
        item.close();
    }

    #[test]
    fn test_loop_play_wraps_to_start_without_gap() {
        let source = audio_source(1.0, 64);
        let mut config = PlayerConfig::default();
        config.audio_sync_decode = true;
        config.loop_play = true;
        let item =
            PlayerItem::open(Box::new(source), Arc::new(PassProvider), config).unwrap();

        // 第一轮：取走全部 10 帧
        let mut last = -1.0;
        for _ in 0..10 {
            let frame = pump_frame(&item);
            assert!(frame.seconds() >= last);
            last = frame.seconds();
        }
        assert!((last - 0.9).abs() < 1e-9);

        // 帧队列清空后 tick 并入备用包，下一帧回到起点
        let frame = pump_frame(&item);
        assert_eq!(frame.seconds(), 0.0, "循环应从头继续");
        item.close();
    }

    fn pump_frame(item: &PlayerItem) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            item.tick();
            if let Some(frame) = item.next_audio_frame() {
                return frame;
            }
            assert!(Instant::now() < deadline, "等待音频帧超时");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let source = audio_source(10.0, 64);
        let item = PlayerItem::open(
            Box::new(source),
            Arc::new(PassProvider),
            PlayerConfig::default(),
        )
        .unwrap();
        item.close();
        item.close();
        assert_eq!(item.state(), PlaybackState::Closed);
    }
}
