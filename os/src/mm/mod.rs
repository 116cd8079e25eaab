mod address;
mod address_space;
mod frame_allocator;
mod kernel_space;
mod page_table;
mod process;
mod user_copy;
#[cfg(test)]
mod test_support;

pub use address::{page_round_up, StepByOne, VPNRange};
pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use address_space::AddressSpace;
pub use frame_allocator::{
    alloc_zeroed, frame_allocator_test, init_frame_allocator, usable_frames, FrameAllocator,
    GlobalFrameAllocator, StackFrameAllocator, FRAME_ALLOCATOR,
};
pub use kernel_space::{
    kernel_pagetable, kvm_init, kvm_init_hart, remap_test, KernelMirror, KernelPageTableBuilder,
};
pub use page_table::{vmprint, PTEFlags, PageTable, PageTableDump, PageTableEntry};
pub use process::ProcessMemory;
pub use user_copy::{copy_in, copy_in_string, copy_out, translated_byte_buffer, UserBuffer};

use crate::config::KernelLayout;

/// 启动时调用一次: 初始化物理页帧分配器, 建好内核页表并在当前核上打开分页。
/// [ekernel, layout.phystop) 之间的物理内存交给页帧分配器。
pub fn init(layout: &KernelLayout, ekernel: PhysAddr) {
    // 初始化物理页帧管理器, 内含堆数据结构 Vec<T>
    init_frame_allocator(ekernel, layout.phystop.into());
    frame_allocator_test(&mut GlobalFrameAllocator);
    // 创建内核页表并让 CPU 开启分页模式, MMU 在地址转换的时候使用内核的多级页表
    kvm_init(layout, &mut GlobalFrameAllocator);
    kvm_init_hart();
    remap_test(layout);
}
