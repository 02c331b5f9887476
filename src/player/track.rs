use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::core::{CodedPacket, Frame, MediaType, PlayerError, TrackInfo};
use crate::player::ring_buffer::RingBufferQueue;
use crate::player::source::{Decoder, DecoderProvider};

/// 轨道状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Idle,
    Decoding,
    Flush,      // 下一轮循环让解码器丢弃内部状态
    Closed,
    Failed,
    Finished,
}

/// 轨道完成/失败事件 - 通过通道异步上报给编排方
#[derive(Debug)]
pub enum TrackEvent {
    Finished { track_id: usize },
    Failed { track_id: usize, error: PlayerError },
}

/// Seek 闩锁
///
/// Seek 后第一批包要扫到关键帧才放行（首包场景例外）；
/// 精确 Seek 模式下，显示时间仍在目标之前的解码帧被静默丢弃
struct SeekLatch {
    seek_time: Option<f64>,
    need_key_frame: bool,
}

/// 码率统计 - 每遇到关键帧结算一次
struct BitrateStats {
    last_key_seconds: Option<f64>,
    bytes_since_key: usize,
    bitrate: f64, // 字节/秒
}

/// 循环播放缓冲 - loop model 激活期间新包进备用队列，
/// 退出时整体并入现役队列，播放无空窗
struct LoopBuffer {
    active: bool,
    standby: Vec<CodedPacket>,
}

/// 连续解码失败多少次后尝试硬解回退
const HW_FALLBACK_THRESHOLD: u32 = 3;
/// 连续解码失败多少次后判定轨道致命
const FATAL_FAILURE_THRESHOLD: u32 = 20;

/// 轨道共享核心 - 同步/异步两种流水线共用
pub struct TrackCore {
    info: TrackInfo,
    frame_queue: RingBufferQueue<Frame>,
    state: Mutex<TrackState>,
    eof: AtomicBool,
    first_packet: AtomicBool,
    accurate_seek: bool,
    latch: Mutex<SeekLatch>,
    bitrate: Mutex<BitrateStats>,
    loop_buffer: Mutex<LoopBuffer>,
    decode_failures: AtomicU32,
    fell_back_to_software: AtomicBool,
    finished_sent: AtomicBool,
    events: Sender<TrackEvent>,
}

impl TrackCore {
    fn new(
        info: TrackInfo,
        frame_capacity: usize,
        accurate_seek: bool,
        events: Sender<TrackEvent>,
    ) -> Self {
        // 帧队列排序，容忍硬解乱序出帧；不扩容，靠阻塞 push 形成背压
        let frame_queue = RingBufferQueue::new(frame_capacity, true, false);
        Self {
            info,
            frame_queue,
            state: Mutex::new(TrackState::Idle),
            eof: AtomicBool::new(false),
            first_packet: AtomicBool::new(true),
            accurate_seek,
            latch: Mutex::new(SeekLatch {
                seek_time: None,
                need_key_frame: false,
            }),
            bitrate: Mutex::new(BitrateStats {
                last_key_seconds: None,
                bytes_since_key: 0,
                bitrate: 0.0,
            }),
            loop_buffer: Mutex::new(LoopBuffer {
                active: false,
                standby: Vec::new(),
            }),
            decode_failures: AtomicU32::new(0),
            fell_back_to_software: AtomicBool::new(false),
            finished_sent: AtomicBool::new(false),
            events,
        }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn frame_queue(&self) -> &RingBufferQueue<Frame> {
        &self.frame_queue
    }

    pub fn state(&self) -> TrackState {
        *self.state.lock()
    }

    fn set_state(&self, state: TrackState) {
        *self.state.lock() = state;
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    pub fn set_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    /// 当前码率估计（字节/秒，自适应码率信号用）
    pub fn bitrate(&self) -> f64 {
        self.bitrate.lock().bitrate
    }

    /// 包进入轨道前的公共过滤
    ///
    /// 返回 None 表示包被拦下（闩锁丢弃或进了循环备用队列）
    fn accept_packet(&self, packet: CodedPacket) -> Option<CodedPacket> {
        {
            let mut loop_buf = self.loop_buffer.lock();
            if loop_buf.active {
                loop_buf.standby.push(packet);
                return None;
            }
        }

        {
            let mut latch = self.latch.lock();
            if latch.need_key_frame {
                let first = self.first_packet.load(Ordering::SeqCst);
                if packet.is_key_frame || first {
                    latch.need_key_frame = false;
                } else {
                    debug!(
                        "🎯 [{}轨道 {}] 等待关键帧，丢弃包 t={:.3}s",
                        self.info.media_type.as_str(),
                        self.info.track_id,
                        packet.seconds()
                    );
                    return None;
                }
            }
        }
        self.first_packet.store(false, Ordering::SeqCst);

        self.update_bitrate(&packet);
        Some(packet)
    }

    /// 码率记账：关键帧之间累计字节数，遇到关键帧结算
    fn update_bitrate(&self, packet: &CodedPacket) {
        let mut stats = self.bitrate.lock();
        if packet.is_key_frame {
            let now = packet.seconds();
            match stats.last_key_seconds {
                Some(last) => {
                    let gap = now - last;
                    if gap <= 0.0 {
                        // Seek / 不连续点：重置
                        stats.last_key_seconds = Some(now);
                        stats.bytes_since_key = 0;
                    } else if gap > 1.0 {
                        stats.bitrate = stats.bytes_since_key as f64 / gap;
                        stats.last_key_seconds = Some(now);
                        stats.bytes_since_key = 0;
                    }
                }
                None => {
                    stats.last_key_seconds = Some(now);
                    stats.bytes_since_key = 0;
                }
            }
        }
        stats.bytes_since_key += packet.size;
    }

    /// 解码结果入队（含精确 Seek 丢帧）
    ///
    /// push 在帧队列满时阻塞，这是解码端的背压
    fn deliver_frame(&self, frame: Frame) {
        if self.accurate_seek {
            let mut latch = self.latch.lock();
            if let Some(target) = latch.seek_time {
                if frame.seconds() + frame.duration_seconds() < target {
                    debug!(
                        "🎯 [{}轨道 {}] 精确 Seek 丢弃过早帧 t={:.3}s < 目标 {:.3}s",
                        self.info.media_type.as_str(),
                        self.info.track_id,
                        frame.seconds(),
                        target
                    );
                    return;
                }
                latch.seek_time = None; // 到达目标，闩锁解除
            }
        }
        self.frame_queue.push(frame);
    }

    /// 解码错误的轨道级吸收策略
    ///
    /// 返回 Some(decoder) 表示已回退到软件解码路径，调用方换用新解码器
    fn absorb_decode_error(
        &self,
        error: PlayerError,
        decoder: &dyn Decoder,
        provider: &dyn DecoderProvider,
    ) -> Option<Box<dyn Decoder>> {
        let failures = self.decode_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "⚠️ [{}轨道 {}] 解码失败（连续第 {} 次），跳过该包: {}",
            self.info.media_type.as_str(),
            self.info.track_id,
            failures,
            error
        );

        // 视频硬解反复失败：一次性回退到软件解码
        if self.info.media_type == MediaType::Video
            && decoder.is_hardware()
            && failures >= HW_FALLBACK_THRESHOLD
            && !self.fell_back_to_software.load(Ordering::SeqCst)
        {
            match provider.create_software(&self.info) {
                Ok(software) => {
                    info!(
                        "🔄 [视频轨道 {}] 硬解连续失败 {} 次，回退软件解码: {}",
                        self.info.track_id,
                        failures,
                        software.description()
                    );
                    self.fell_back_to_software.store(true, Ordering::SeqCst);
                    self.decode_failures.store(0, Ordering::SeqCst);
                    return Some(software);
                }
                Err(e) => {
                    error!("❌ [视频轨道 {}] 软件解码回退失败: {}", self.info.track_id, e);
                }
            }
        }

        if failures >= FATAL_FAILURE_THRESHOLD {
            self.fail(PlayerError::Decode(format!(
                "轨道 {} 连续解码失败 {} 次",
                self.info.track_id, failures
            )));
        }
        None
    }

    fn decode_succeeded(&self) {
        self.decode_failures.store(0, Ordering::SeqCst);
    }

    /// 轨道级致命：只让本轨道 Failed，由编排方决定是否整体失败
    fn fail(&self, error: PlayerError) {
        error!(
            "❌ [{}轨道 {}] 进入 Failed: {}",
            self.info.media_type.as_str(),
            self.info.track_id,
            error
        );
        self.set_state(TrackState::Failed);
        let _ = self.events.send(TrackEvent::Failed {
            track_id: self.info.track_id,
            error,
        });
    }

    /// EOF 且包队列耗尽时由解码侧调用
    fn mark_finished(&self) {
        if *self.state.lock() == TrackState::Decoding {
            self.set_state(TrackState::Finished);
        }
        if self
            .finished_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(
                "🏁 [{}轨道 {}] 播放完成",
                self.info.media_type.as_str(),
                self.info.track_id
            );
            let _ = self.events.send(TrackEvent::Finished {
                track_id: self.info.track_id,
            });
        }
    }

    /// Seek：挂起待决目标、清帧队列、武装关键帧闩锁、重新拉起解码
    fn arm_seek(&self, seconds: f64) {
        {
            let mut latch = self.latch.lock();
            latch.seek_time = Some(seconds);
            latch.need_key_frame = true;
        }
        {
            // Seek 后绕回缓冲里的包已经失效
            let mut loop_buf = self.loop_buffer.lock();
            loop_buf.active = false;
            loop_buf.standby.clear();
        }
        self.frame_queue.flush();
        self.eof.store(false, Ordering::SeqCst);
        self.finished_sent.store(false, Ordering::SeqCst);
        // 重新拉起的轨道拿到全新的失败预算
        self.decode_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.lock();
        match *state {
            TrackState::Closed => {}
            _ => *state = TrackState::Flush,
        }
    }

    /// 缓存 Seek 命中：帧队列头已由编排方提交，只需复位闩锁与完成标记
    fn commit_cached_seek(&self, seconds: f64) {
        let mut latch = self.latch.lock();
        latch.need_key_frame = false;
        latch.seek_time = if self.accurate_seek { Some(seconds) } else { None };
        drop(latch);
        self.finished_sent.store(false, Ordering::SeqCst);
        self.decode_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.lock();
        if matches!(*state, TrackState::Finished | TrackState::Failed) {
            *state = TrackState::Decoding;
        }
    }

    pub fn is_loop_model(&self) -> bool {
        self.loop_buffer.lock().active
    }

    /// 备用队列覆盖的时长（秒）
    ///
    /// loop model 期间必须计入占用，否则缓冲水位看不到备用包，
    /// reader 不会被暂停，备用队列就失去上界
    fn standby_loaded_seconds(&self) -> f64 {
        let loop_buf = self.loop_buffer.lock();
        match (loop_buf.standby.first(), loop_buf.standby.last()) {
            (Some(first), Some(last)) => {
                (last.seconds() + last.duration_seconds() - first.seconds()).max(0.0)
            }
            _ => 0.0,
        }
    }

    fn enter_loop_model(&self) {
        self.loop_buffer.lock().active = true;
    }

    /// 退出循环缓冲模式，把备用包逐个交给 `deliver`
    ///
    /// 整个并入过程持有 loop 锁：reader 投递新包时会在 accept_packet
    /// 的同一把锁上等待，备用包先于绕回后的新包进入现役队列
    fn exit_loop_model_with<F: FnMut(CodedPacket)>(&self, mut deliver: F) -> usize {
        let mut loop_buf = self.loop_buffer.lock();
        if !loop_buf.active {
            return 0;
        }
        loop_buf.active = false;
        let count = loop_buf.standby.len();
        for packet in loop_buf.standby.drain(..) {
            deliver(packet);
        }
        count
    }
}

/// 同步轨道 - 在调用方线程上就地解码
pub struct SyncTrack {
    core: Arc<TrackCore>,
    decoder: Mutex<Box<dyn Decoder>>,
    provider: Arc<dyn DecoderProvider>,
}

impl SyncTrack {
    pub fn new(
        info: TrackInfo,
        frame_capacity: usize,
        accurate_seek: bool,
        decoder: Box<dyn Decoder>,
        provider: Arc<dyn DecoderProvider>,
        events: Sender<TrackEvent>,
    ) -> Self {
        let core = Arc::new(TrackCore::new(info, frame_capacity, accurate_seek, events));
        core.set_state(TrackState::Decoding);
        Self {
            core,
            decoder: Mutex::new(decoder),
            provider,
        }
    }

    fn put_packet(&self, packet: CodedPacket) {
        if matches!(self.core.state(), TrackState::Closed | TrackState::Failed) {
            return;
        }
        let Some(packet) = self.core.accept_packet(packet) else {
            return;
        };
        self.decode_now(&packet);
    }

    /// 就地解码一个包（已通过入口过滤）
    fn decode_now(&self, packet: &CodedPacket) {
        let mut decoder = self.decoder.lock();
        if self.core.state() == TrackState::Flush {
            decoder.flush();
            self.core.set_state(TrackState::Decoding);
        }

        match decoder.decode(packet) {
            Ok(frames) => {
                self.core.decode_succeeded();
                for frame in frames {
                    self.core.deliver_frame(frame);
                }
            }
            Err(e) => {
                if let Some(new_decoder) =
                    self.core.absorb_decode_error(e, decoder.as_ref(), self.provider.as_ref())
                {
                    decoder.shutdown();
                    *decoder = new_decoder;
                }
            }
        }
    }

    fn on_eof(&self) {
        self.core.set_eof();
        self.core.mark_finished();
    }

    fn close(&self) {
        self.core.set_state(TrackState::Closed);
        self.core.frame_queue.shutdown();
        self.decoder.lock().shutdown();
    }
}

/// 异步轨道 - 专属工作线程从私有包队列取包解码
pub struct AsyncTrack {
    core: Arc<TrackCore>,
    packet_queue: Arc<RingBufferQueue<CodedPacket>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTrack {
    pub fn new(
        info: TrackInfo,
        packet_capacity: usize,
        frame_capacity: usize,
        accurate_seek: bool,
        decoder: Box<dyn Decoder>,
        provider: Arc<dyn DecoderProvider>,
        events: Sender<TrackEvent>,
    ) -> Self {
        let core = Arc::new(TrackCore::new(info, frame_capacity, accurate_seek, events));
        core.set_state(TrackState::Decoding);
        // 包队列按到达顺序（reader 顺序）交付，不排序；不扩容，满即背压
        let packet_queue = Arc::new(RingBufferQueue::new(packet_capacity, false, false));

        let worker_core = core.clone();
        let worker_queue = packet_queue.clone();
        let worker = thread::spawn(move || {
            decode_worker(worker_core, worker_queue, decoder, provider);
        });

        Self {
            core,
            packet_queue,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn put_packet(&self, packet: CodedPacket) {
        if matches!(self.core.state(), TrackState::Closed | TrackState::Failed) {
            return;
        }
        if let Some(packet) = self.core.accept_packet(packet) {
            // 队列满时阻塞 reader，这是刻意的背压
            self.packet_queue.push(packet);
        }
    }

    fn on_eof(&self) {
        self.core.set_eof();
        // 唤醒阻塞在空包队列上的解码线程，让它判定播完
        self.packet_queue.wake_all();
    }

    fn close(&self) {
        self.core.set_state(TrackState::Closed);
        self.packet_queue.shutdown();
        self.core.frame_queue.shutdown();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AsyncTrack {
    fn drop(&mut self) {
        self.close();
    }
}

/// 解码工作线程
///
/// 循环：阻塞取包 -> 解码 -> 帧入队（阻塞背压）。
/// 空队列上的阻塞由 shutdown / flush / EOF 的唤醒打断。
/// 状态 Flush 时让解码器丢弃内部状态后继续；EOF 且包队列空时
/// 转 Finished 并通知编排方；Closed 后退出前释放解码器
fn decode_worker(
    core: Arc<TrackCore>,
    packet_queue: Arc<RingBufferQueue<CodedPacket>>,
    mut decoder: Box<dyn Decoder>,
    provider: Arc<dyn DecoderProvider>,
) {
    let label = format!(
        "{}轨道 {}",
        core.info().media_type.as_str(),
        core.info().track_id
    );
    info!("🧵 [{}] 解码线程启动", label);

    loop {
        match core.state() {
            TrackState::Closed => break,
            TrackState::Failed => {
                // 等待编排方关闭；继续排空包队列避免 reader 卡死
                if packet_queue.pop(false, None).is_none() {
                    thread::sleep(Duration::from_millis(10));
                }
                continue;
            }
            TrackState::Flush => {
                debug!("🔄 [{}] 解码器 flush", label);
                decoder.flush();
                core.set_state(TrackState::Decoding);
                continue;
            }
            TrackState::Idle => {
                core.set_state(TrackState::Decoding);
                continue;
            }
            TrackState::Finished => {
                // Seek 会把状态改回 Flush；在那之前保持待机
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            TrackState::Decoding => {}
        }

        match packet_queue.pop(true, None) {
            Some(packet) => match decoder.decode(&packet) {
                Ok(frames) => {
                    core.decode_succeeded();
                    for frame in frames {
                        if core.state() == TrackState::Closed {
                            break;
                        }
                        core.deliver_frame(frame);
                    }
                }
                Err(e) => {
                    if let Some(new_decoder) =
                        core.absorb_decode_error(e, decoder.as_ref(), provider.as_ref())
                    {
                        decoder.shutdown();
                        decoder = new_decoder;
                    }
                }
            },
            None => {
                // 阻塞取包被唤醒：关闭、flush 或 EOF
                if packet_queue.is_shutdown() {
                    break;
                }
                if core.is_eof() {
                    core.mark_finished();
                }
            }
        }
    }

    decoder.shutdown();
    info!("🧵 [{}] 解码线程结束", label);
}

/// 播放轨道 - 同步/异步两种流水线的封闭变体
pub enum PlayerTrack {
    Sync(SyncTrack),
    Async(AsyncTrack),
}

impl PlayerTrack {
    fn core(&self) -> &TrackCore {
        match self {
            PlayerTrack::Sync(t) => &t.core,
            PlayerTrack::Async(t) => &t.core,
        }
    }

    pub fn info(&self) -> &TrackInfo {
        self.core().info()
    }

    pub fn media_type(&self) -> MediaType {
        self.core().info().media_type
    }

    pub fn frame_queue(&self) -> &RingBufferQueue<Frame> {
        self.core().frame_queue()
    }

    pub fn state(&self) -> TrackState {
        self.core().state()
    }

    pub fn bitrate(&self) -> f64 {
        self.core().bitrate()
    }

    pub fn is_eof(&self) -> bool {
        self.core().is_eof()
    }

    /// 投递一个包（同步轨道就地解码，异步轨道入队）
    pub fn put_packet(&self, packet: CodedPacket) {
        match self {
            PlayerTrack::Sync(t) => t.put_packet(packet),
            PlayerTrack::Async(t) => t.put_packet(packet),
        }
    }

    /// 源到达 EOF
    pub fn on_eof(&self) {
        match self {
            PlayerTrack::Sync(t) => t.on_eof(),
            PlayerTrack::Async(t) => t.on_eof(),
        }
    }

    /// 武装完整 Seek（清队列 + 关键帧闩锁 + 解码器 flush）
    pub fn arm_seek(&self, seconds: f64) {
        self.core().arm_seek(seconds);
        if let PlayerTrack::Async(t) = self {
            t.packet_queue.flush();
        }
        if let PlayerTrack::Sync(t) = self {
            // 同步轨道没有工作线程消化 Flush 状态，立刻执行
            t.decoder.lock().flush();
            t.core.set_state(TrackState::Decoding);
        }
    }

    /// 缓存 Seek 命中后的提交
    pub fn commit_cached_seek(&self, seconds: f64) {
        self.core().commit_cached_seek(seconds);
    }

    /// 丢弃一个 GOP 的包：当前包 + 到下一个关键帧为止的非关键包
    pub fn drop_gop(&self) {
        if let PlayerTrack::Async(t) = self {
            let first = t.packet_queue.pop(false, None);
            let rest = t.packet_queue.search(&|p: &CodedPacket, _| !p.is_key_frame);
            if first.is_some() || !rest.is_empty() {
                debug!(
                    "🗑️ [{}轨道 {}] 丢弃 GOP: {} 个包",
                    self.media_type().as_str(),
                    self.info().track_id,
                    rest.len() + usize::from(first.is_some())
                );
            }
        }
    }

    /// 丢弃下一个包
    pub fn drop_next_packet(&self) {
        if let PlayerTrack::Async(t) = self {
            if t.packet_queue.pop(false, None).is_some() {
                debug!(
                    "🗑️ [{}轨道 {}] 丢弃下一个包",
                    self.media_type().as_str(),
                    self.info().track_id
                );
            }
        }
    }

    /// 进入/退出循环缓冲模式；退出时把备用队列并入现役队列
    pub fn set_loop_model(&self, active: bool) {
        if active {
            self.core().enter_loop_model();
            return;
        }
        let merged = match self {
            PlayerTrack::Async(t) => t
                .core
                .exit_loop_model_with(|packet| t.packet_queue.push(packet)),
            PlayerTrack::Sync(t) => t.core.exit_loop_model_with(|packet| t.decode_now(&packet)),
        };
        if merged > 0 {
            info!(
                "🔁 [{}轨道 {}] 退出 loop model，并入 {} 个备用包",
                self.media_type().as_str(),
                self.info().track_id,
                merged
            );
        }
    }

    /// 占用快照（缓冲策略的输入）
    pub fn occupancy(&self, sync_decode: bool) -> crate::player::buffering::TrackOccupancy {
        let (packet_count, packet_capacity, packet_loaded) = match self {
            PlayerTrack::Async(t) => (
                t.packet_queue.len(),
                t.packet_queue.capacity(),
                t.packet_queue.loaded_seconds(),
            ),
            PlayerTrack::Sync(_) => (0, 1, 0.0),
        };
        let frame_queue = self.frame_queue();
        crate::player::buffering::TrackOccupancy {
            media_type: self.media_type(),
            packet_count,
            packet_capacity,
            frame_count: frame_queue.len(),
            loaded_time: packet_loaded
                + frame_queue.loaded_seconds()
                + self.core().standby_loaded_seconds(),
            is_end_of_file: self.is_eof(),
            sync_decode,
        }
    }

    pub fn is_loop_model(&self) -> bool {
        self.core().is_loop_model()
    }

    /// 同步轨道没有工作线程，播完判定由编排方轮询
    ///
    /// 异步轨道的同等判定在解码线程里做
    pub fn poll_finish(&self) {
        if let PlayerTrack::Sync(t) = self {
            if t.core.is_eof() && t.core.state() == TrackState::Decoding {
                t.core.mark_finished();
            }
        }
    }

    /// 异步轨道的包队列深度（同步轨道恒为 0）
    pub fn packet_count(&self) -> usize {
        match self {
            PlayerTrack::Async(t) => t.packet_queue.len(),
            PlayerTrack::Sync(_) => 0,
        }
    }

    /// 关闭轨道（幂等）- 先解码器、再队列、最后线程
    pub fn close(&self) {
        match self {
            PlayerTrack::Sync(t) => t.close(),
            PlayerTrack::Async(t) => t.close(),
        }
    }
}
