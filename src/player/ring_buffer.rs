use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::core::{CodedPacket, Frame};

/// 队列元素 - 排序 / Seek 需要的最小接口
pub trait QueueElement {
    /// 时间戳（秒）
    fn seconds(&self) -> f64;

    /// 持续时间（秒）
    fn duration_seconds(&self) -> f64 {
        0.0
    }

    /// 是否关键帧
    fn is_key_frame(&self) -> bool {
        false
    }
}

impl QueueElement for CodedPacket {
    fn seconds(&self) -> f64 {
        CodedPacket::seconds(self)
    }

    fn duration_seconds(&self) -> f64 {
        CodedPacket::duration_seconds(self)
    }

    fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }
}

impl QueueElement for Frame {
    fn seconds(&self) -> f64 {
        Frame::seconds(self)
    }

    fn duration_seconds(&self) -> f64 {
        Frame::duration_seconds(self)
    }

    fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }
}

/// 阻塞环形队列 - 包队列与帧队列共用的存储
///
/// - 容量始终为 2 的幂，head/tail 是单调递增计数器，按 `capacity-1` 取模定位槽位
/// - `sorted`：push 时在存活区间内向后插入排序，保证按时间戳非降序弹出
/// - `expanding`：满时扩容（容量翻倍）而不是阻塞调用方
/// - 非扩容队列满时 push 会一直阻塞到消费端腾出空间，这是刻意的背压而非错误
/// - 除显式 flush 外，队列绝不静默丢弃元素
/// - shutdown 后所有阻塞等待立即返回，后续操作都是 no-op
pub struct RingBufferQueue<T> {
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    slots: Vec<Option<T>>,
    head: u64, // 单调递增，head <= tail
    tail: u64,
    sorted: bool,
    expanding: bool,
    dead: bool,
    wake_pending: bool, // wake_all/flush 置位，空队列上的下一次阻塞 pop 消费它并返回 None
}

impl<T> Inner<T> {
    fn mask(&self) -> u64 {
        self.slots.len() as u64 - 1
    }

    fn count(&self) -> usize {
        (self.tail - self.head) as usize
    }

    fn is_full(&self) -> bool {
        self.count() == self.slots.len()
    }

    fn slot(&self, index: u64) -> &Option<T> {
        &self.slots[(index & self.mask()) as usize]
    }

    fn take(&mut self, index: u64) -> Option<T> {
        let mask = self.mask();
        self.slots[(index & mask) as usize].take()
    }

    fn put(&mut self, index: u64, item: T) {
        let mask = self.mask();
        self.slots[(index & mask) as usize] = Some(item);
    }

    /// 容量翻倍并按原顺序重排存活区间
    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let mut new_slots: Vec<Option<T>> = Vec::with_capacity(new_cap);
        new_slots.resize_with(new_cap, || None);

        let old_mask = self.mask();
        let new_mask = new_cap as u64 - 1;
        for index in self.head..self.tail {
            let item = self.slots[(index & old_mask) as usize].take();
            new_slots[(index & new_mask) as usize] = item;
        }
        self.slots = new_slots;
    }
}

impl<T: QueueElement> RingBufferQueue<T> {
    /// 创建队列，容量向上取整到 2 的幂
    pub fn new(capacity: usize, sorted: bool, expanding: bool) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            state: Mutex::new(Inner {
                slots,
                head: 0,
                tail: 0,
                sorted,
                expanding,
                dead: false,
                wake_pending: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// 入队
    ///
    /// 排序队列在存活区间内向后冒泡，复杂度 O(移动距离)；
    /// 非扩容队列满时阻塞等待消费端
    pub fn push(&self, item: T) {
        let mut inner = self.state.lock();
        if inner.dead {
            return; // 已关闭，静默丢弃
        }

        while inner.is_full() {
            if inner.expanding {
                let old_cap = inner.slots.len();
                inner.grow();
                debug!("📦 环形队列扩容: {} -> {}", old_cap, inner.slots.len());
                break;
            }
            self.not_full.wait(&mut inner);
            if inner.dead {
                return;
            }
        }

        let tail = inner.tail;
        inner.put(tail, item);
        inner.tail += 1;

        if inner.sorted {
            // 向后插入排序，只在存活区间内移动
            let mut index = inner.tail - 1;
            while index > inner.head {
                let cur = inner.slot(index).as_ref().map(|i| i.seconds());
                let prev = inner.slot(index - 1).as_ref().map(|i| i.seconds());
                match (cur, prev) {
                    (Some(cur), Some(prev)) if prev > cur => {
                        let mask = inner.mask();
                        let a = (index & mask) as usize;
                        let b = ((index - 1) & mask) as usize;
                        inner.slots.swap(a, b);
                        index -= 1;
                    }
                    _ => break,
                }
            }
        }

        self.not_empty.notify_one();
    }

    /// 出队
    ///
    /// - `wait` 为 true 且队列为空时阻塞，直到有元素或队列关闭
    /// - `predicate` 对队头元素和当前占用数求值，返回 false 则放弃本次
    ///   消费（"还没到显示时间就不取"）；None 恒为取出
    pub fn pop(&self, wait: bool, predicate: Option<&dyn Fn(&T, usize) -> bool>) -> Option<T> {
        let mut inner = self.state.lock();
        loop {
            if inner.count() == 0 {
                if inner.dead || !wait {
                    return None;
                }
                if inner.wake_pending {
                    inner.wake_pending = false;
                    return None;
                }
                self.not_empty.wait(&mut inner);
                continue;
            }

            if let Some(pred) = predicate {
                let count = inner.count();
                let head = inner.head;
                match inner.slot(head).as_ref() {
                    Some(item) => {
                        if !pred(item, count) {
                            return None; // 不消费，队头原样保留
                        }
                    }
                    None => {
                        warn!("📦 环形队列队头出现空槽位，放弃本次 pop");
                        return None;
                    }
                }
            }

            let head = inner.head;
            let item = inner.take(head);
            inner.head += 1;
            self.not_full.notify_one();
            return item;
        }
    }

    /// 从队头按谓词连续取出所有匹配元素（快速 Seek 缓存路径用）
    ///
    /// 遇到空洞视为内部一致性故障，提前停止并返回已取出的部分结果
    pub fn search(&self, predicate: &dyn Fn(&T, usize) -> bool) -> Vec<T> {
        let mut inner = self.state.lock();
        let mut out = Vec::new();
        while inner.count() > 0 {
            let count = inner.count();
            let head = inner.head;
            let matched = match inner.slot(head).as_ref() {
                Some(item) => pred_check(predicate, item, count),
                None => {
                    warn!("📦 search 扫描到空槽位，提前返回 {} 个元素", out.len());
                    break;
                }
            };
            if !matched {
                break;
            }
            if let Some(item) = inner.take(head) {
                out.push(item);
            }
            inner.head += 1;
        }
        if !out.is_empty() {
            self.not_full.notify_all();
        }
        out
    }

    /// 定位距目标时间最近的队列索引，不修改队列
    ///
    /// - 目标在缓冲区间 [队头, 队尾] 之外时返回 None，调用方回退到容器级 Seek
    /// - `need_key_frame` 要求命中处（或更早处）必须是关键帧，向队头方向回退查找
    /// - 返回 (索引, 该处时间)，由调用方再用 `update_head` 提交
    pub fn seek(&self, seconds: f64, need_key_frame: bool) -> Option<(u64, f64)> {
        let inner = self.state.lock();
        if inner.count() == 0 {
            return None;
        }

        let head_time = inner.slot(inner.head).as_ref()?.seconds();
        if seconds < head_time {
            // 目标在队头之前，缓存无法向回定位
            return None;
        }

        let back = inner.tail - 1;
        let back_item = inner.slot(back).as_ref()?;
        if seconds > back_item.seconds() + back_item.duration_seconds() {
            return None;
        }

        // 线性前向扫描：找到最后一个时间 <= 目标的索引
        let mut found = inner.head;
        for index in inner.head..inner.tail {
            match inner.slot(index).as_ref() {
                Some(item) => {
                    if item.seconds() <= seconds {
                        found = index;
                    } else {
                        break;
                    }
                }
                None => {
                    warn!("📦 seek 扫描到空槽位，提前停止");
                    break;
                }
            }
        }

        if need_key_frame {
            // 向队头方向回退到最近的关键帧
            let mut index = found;
            loop {
                match inner.slot(index).as_ref() {
                    Some(item) if item.is_key_frame() => {
                        return Some((index, item.seconds()));
                    }
                    _ => {}
                }
                if index == inner.head {
                    return None; // 缓存内没有可用关键帧
                }
                index -= 1;
            }
        }

        let time = inner.slot(found).as_ref()?.seconds();
        Some((found, time))
    }

    /// 提交 Seek 结果：丢弃新队头之前的所有元素
    ///
    /// 索引已失效（并发消费把 head 推过了它）时不做任何修改并返回 false，
    /// 调用方据此放弃缓存路径
    pub fn update_head(&self, index: u64) -> bool {
        let mut inner = self.state.lock();
        if index < inner.head || index > inner.tail {
            warn!("📦 update_head 索引越界: {} 不在 [{}, {}]", index, inner.head, inner.tail);
            return false;
        }
        let head = inner.head;
        for i in head..index {
            inner.take(i);
        }
        inner.head = index;
        self.not_full.notify_all();
        true
    }

    /// 唤醒等待者而不改变队列内容（EOF / 状态变更通知用）
    ///
    /// 空队列上的下一次阻塞 pop 返回 None，即使它在本次调用之后才进入等待
    pub fn wake_all(&self) {
        let mut inner = self.state.lock();
        inner.wake_pending = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// 清空队列并唤醒所有等待者
    pub fn flush(&self) {
        let mut inner = self.state.lock();
        let head = inner.head;
        let tail = inner.tail;
        for index in head..tail {
            inner.take(index);
        }
        inner.head = inner.tail;
        inner.wake_pending = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// 关闭队列 - 幂等；清空并释放所有阻塞等待者，后续操作皆为 no-op
    pub fn shutdown(&self) {
        let mut inner = self.state.lock();
        if !inner.dead {
            inner.dead = true;
            let head = inner.head;
            let tail = inner.tail;
            for index in head..tail {
                inner.take(index);
            }
            inner.head = inner.tail;
        }
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().dead
    }

    pub fn len(&self) -> usize {
        self.state.lock().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// 队头时间（秒）
    pub fn front_seconds(&self) -> Option<f64> {
        let inner = self.state.lock();
        if inner.count() == 0 {
            return None;
        }
        inner.slot(inner.head).as_ref().map(|i| i.seconds())
    }

    /// 队尾时间（秒）
    pub fn back_seconds(&self) -> Option<f64> {
        let inner = self.state.lock();
        if inner.count() == 0 {
            return None;
        }
        inner.slot(inner.tail - 1).as_ref().map(|i| i.seconds())
    }

    /// 已缓冲时长（秒）= 队尾时间 + 队尾时长 - 队头时间
    pub fn loaded_seconds(&self) -> f64 {
        let inner = self.state.lock();
        if inner.count() == 0 {
            return 0.0;
        }
        let front = match inner.slot(inner.head).as_ref() {
            Some(item) => item.seconds(),
            None => return 0.0,
        };
        match inner.slot(inner.tail - 1).as_ref() {
            Some(item) => (item.seconds() + item.duration_seconds() - front).max(0.0),
            None => 0.0,
        }
    }
}

fn pred_check<T>(predicate: &dyn Fn(&T, usize) -> bool, item: &T, count: usize) -> bool {
    predicate(item, count)
}
