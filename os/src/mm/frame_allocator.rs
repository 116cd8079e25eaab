use super::{PhysAddr, PhysPageNum};
use alloc::vec::Vec;
use spin::Mutex;
use lazy_static::*;

// 以物理页号为单位进行物理页帧的分配和回收
// 分配出去的页帧内容是未初始化的, 需要清零的话由调用者负责
pub trait FrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

// 栈式物理页帧管理策略
// 物理页号区间 [current,end) 此前均 从未 被分配出去过
// recycled 以 后入先出 的方式保存了被回收的物理页号
pub struct StackFrameAllocator {
    start: usize,
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    pub const fn new() -> Self {
        Self {
            start: 0,
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }
    // 真正被使用起来之前，需要调用 init 方法将自身的 [current,end) 初始化为可用物理页号区间
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.start = l.0;
        self.current = l.0;
        self.end = r.0;
        self.recycled.clear();
        info!("[kernel] last {} Physical Frames.", self.end - self.current);
    }
    pub fn usable_frames(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

impl Default for StackFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        // 优先复用之前回收的物理页号
        if let Some(ppn) = self.recycled.pop() {
            Some(ppn.into())
        } else if self.current == self.end {
            // 内存耗尽分配失败
            None
        } else {
            self.current += 1;
            Some((self.current - 1).into())
        }
    }
    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        // validity check
        // NOTE: self.recycled 中的元素一定在 [start, current) 之内
        if ppn < self.start || ppn >= self.current || self.recycled.contains(&ppn) {
            panic!("Frame ppn={:#x} has not been allocated!", ppn);
        }
        // recycle
        self.recycled.push(ppn);
    }
}

type FrameAllocatorImpl = StackFrameAllocator;

// StackFrameAllocator 的全局实例, 内核里所有进程共用
lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<FrameAllocatorImpl> =
        Mutex::new(FrameAllocatorImpl::new());
}

// 可用的物理内存对应的物理页号: [ekernel.ceil(), MEMORY_END.floor())
pub fn init_frame_allocator(ekernel: PhysAddr, memory_end: PhysAddr) {
    FRAME_ALLOCATOR
        .lock()
        .init(ekernel.ceil(), memory_end.floor());
    info!("[kernel] Frame Total Size [{:#x}, {:#x})", ekernel.0, memory_end.0);
}

/// 全局分配器的句柄, 每次分配/回收时才去拿锁
pub struct GlobalFrameAllocator;

impl FrameAllocator for GlobalFrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        FRAME_ALLOCATOR.lock().alloc()
    }
    fn dealloc(&mut self, ppn: PhysPageNum) {
        FRAME_ALLOCATOR.lock().dealloc(ppn)
    }
}

pub fn usable_frames() -> usize {
    FRAME_ALLOCATOR
        .lock()
        .usable_frames()
}

/// 分配一个物理页帧并把所有字节清零
pub fn alloc_zeroed(allocator: &mut dyn FrameAllocator) -> Option<PhysPageNum> {
    allocator.alloc().map(|ppn| {
        ppn.get_bytes_array().fill(0);
        ppn
    })
}

#[allow(unused)]
pub fn frame_allocator_test(allocator: &mut dyn FrameAllocator) {
    let mut v: Vec<PhysPageNum> = Vec::new();
    for _ in 0..5 {
        let frame = allocator.alloc().unwrap();
        debug!("{:?}", frame);
        v.push(frame);
    }
    for frame in v.drain(..) {
        allocator.dealloc(frame);
    }
    for _ in 0..5 {
        let frame = allocator.alloc().unwrap();
        debug!("{:?}", frame);
        v.push(frame);
    }
    for frame in v.drain(..) {
        allocator.dealloc(frame);
    }
    info!("frame_allocator_test passed!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::PhysArena;

    #[test]
    fn recycled_frames_are_reused_first() {
        let mut arena = PhysArena::new(8);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        assert_ne!(a, b);
        arena.dealloc(a);
        assert_eq!(arena.alloc(), Some(a));
        assert_eq!(arena.usable_frames(), 6);
        frame_allocator_test(&mut arena);
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let mut arena = PhysArena::new(2);
        assert!(arena.alloc().is_some());
        assert!(arena.alloc().is_some());
        assert_eq!(arena.alloc(), None);
        assert_eq!(arena.usable_frames(), 0);
    }

    #[test]
    #[should_panic(expected = "has not been allocated")]
    fn double_free_is_fatal() {
        let mut arena = PhysArena::new(2);
        let a = arena.alloc().unwrap();
        arena.dealloc(a);
        arena.dealloc(a);
    }

    #[test]
    fn alloc_zeroed_clears_old_contents() {
        let mut arena = PhysArena::new(1);
        let a = arena.alloc().unwrap();
        a.get_bytes_array()[17] = 0xaa;
        arena.dealloc(a);
        let b = alloc_zeroed(&mut arena).unwrap();
        assert_eq!(a, b);
        assert!(b.get_bytes_array().iter().all(|&x| x == 0));
    }

    #[test]
    fn global_allocator_handle() {
        // 整个测试进程里只有这一处用到全局分配器
        let arena = PhysArena::new(8);
        let (l, r) = arena.bounds();
        init_frame_allocator(l.into(), r.into());
        assert_eq!(usable_frames(), 8);
        let mut global = GlobalFrameAllocator;
        let frame = alloc_zeroed(&mut global).unwrap();
        assert_eq!(usable_frames(), 7);
        global.dealloc(frame);
        assert_eq!(usable_frames(), 8);
    }
}
