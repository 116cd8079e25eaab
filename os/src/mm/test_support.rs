//! 宿主机上的"物理内存": 一块按页对齐的堆内存, 地址本身就是物理地址,
//! 和内核里恒等映射的效果一样。

use super::{FrameAllocator, PhysPageNum, StackFrameAllocator};
use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use std::alloc::Layout;

pub struct PhysArena {
    base: *mut u8,
    layout: Layout,
    frames: StackFrameAllocator,
}

impl PhysArena {
    pub fn new(frames: usize) -> Self {
        crate::logging::init();
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // 故意不清零: 分配器交出的页帧本来就是未初始化的
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null());
        let l = base as usize >> PAGE_SIZE_BITS;
        let mut allocator = StackFrameAllocator::new();
        allocator.init(PhysPageNum(l), PhysPageNum(l + frames));
        Self {
            base,
            layout,
            frames: allocator,
        }
    }

    pub fn usable_frames(&self) -> usize {
        self.frames.usable_frames()
    }

    /// 扣下页帧直到只剩 keep 个可用, 让后面某一次分配恰好失败
    pub fn reserve_all_but(&mut self, keep: usize) -> Vec<PhysPageNum> {
        let mut reserved = Vec::new();
        while self.usable_frames() > keep {
            reserved.push(self.frames.alloc().unwrap());
        }
        reserved
    }

    pub fn release(&mut self, reserved: Vec<PhysPageNum>) {
        for ppn in reserved {
            self.frames.dealloc(ppn);
        }
    }

    /// [start, end) 的字节地址
    pub fn bounds(&self) -> (usize, usize) {
        let start = self.base as usize;
        (start, start + self.layout.size())
    }
}

impl FrameAllocator for PhysArena {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        let ppn = self.frames.alloc()?;
        // 模拟脏页, 确认调用者自己清零
        ppn.get_bytes_array().fill(0x5a);
        Some(ppn)
    }
    fn dealloc(&mut self, ppn: PhysPageNum) {
        self.frames.dealloc(ppn)
    }
}

impl Drop for PhysArena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) }
    }
}
