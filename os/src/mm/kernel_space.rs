use super::{alloc_zeroed, page_round_up, FrameAllocator, PTEFlags, PageTable, PhysAddr, VirtAddr};
use crate::config::{KernelLayout, PAGE_SIZE, TRAMPOLINE};
use crate::error::{VmError, VmResult};
use spin::Once;

// 全局内核页表, 启动时建好一次, 之后只读
static KERNEL_PAGE_TABLE: Once<PageTable> = Once::new();

/// 启动阶段构建内核页表的唯一入口。
/// 启动时的映射失败没有任何补救办法, 所以这里直接 panic。
pub struct KernelPageTableBuilder<'a> {
    page_table: PageTable,
    allocator: &'a mut dyn FrameAllocator,
}

impl<'a> KernelPageTableBuilder<'a> {
    pub fn new(allocator: &'a mut dyn FrameAllocator) -> Self {
        let page_table = match PageTable::new(allocator) {
            Ok(page_table) => page_table,
            Err(err) => panic!("kvm_init: {}", err),
        };
        Self {
            page_table,
            allocator,
        }
    }
    // kvmmap
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, size: usize, perm: PTEFlags) -> &mut Self {
        if let Err(err) = self.page_table.map_range(va, size, pa, perm, self.allocator) {
            panic!("kvmmap: {:?} -> {:?}: {}", va, pa, err);
        }
        self
    }
    pub fn map_layout(&mut self, layout: &KernelLayout) -> &mut Self {
        for region in layout.boot_regions().iter() {
            info!(
                "[kernel] mapping {} [{:#x}, {:#x})",
                region.name,
                region.va.0,
                region.va.0 + region.size
            );
            self.map(region.va, region.pa, region.size, region.perm);
        }
        self
    }
    /// 拿到建好的页表但不发布, 调用者自己负责它的页帧
    pub fn build(self) -> PageTable {
        self.page_table
    }
    /// 发布为全局内核页表, 只能调用一次
    pub fn finish(self) -> &'static PageTable {
        assert!(KERNEL_PAGE_TABLE.get().is_none(), "kvm_init: kernel page table already built");
        KERNEL_PAGE_TABLE.call_once(|| self.page_table)
    }
}

pub fn kernel_pagetable() -> &'static PageTable {
    match KERNEL_PAGE_TABLE.get() {
        Some(page_table) => page_table,
        None => panic!("kernel page table is not built yet"),
    }
}

/// 创建全局内核页表
pub fn kvm_init(layout: &KernelLayout, allocator: &mut dyn FrameAllocator) -> &'static PageTable {
    let mut builder = KernelPageTableBuilder::new(allocator);
    builder.map_layout(layout);
    let page_table = builder.finish();
    info!("[kernel] kernel page table at {:?}", page_table.root_ppn());
    page_table
}

/// 在当前核上打开分页, 使用全局内核页表
pub fn kvm_init_hart() {
    kernel_pagetable().activate();
}

// 手动查页表, 确认各个区域的权限没有配错
fn check_layout(page_table: &PageTable, layout: &KernelLayout) {
    let mid_text: VirtAddr = ((layout.kernbase + layout.etext) / 2).into();
    let mid_data: VirtAddr = ((layout.etext + layout.phystop) / 2).into();
    let text = page_table.translate(mid_text.floor()).unwrap();
    assert!(!text.writable());
    assert!(text.executable());
    let data = page_table.translate(mid_data.floor()).unwrap();
    assert!(!data.executable());
    assert!(data.writable());
    let trampoline = page_table.translate(VirtAddr::from(TRAMPOLINE).floor()).unwrap();
    assert_eq!(trampoline.permissions(), PTEFlags::R | PTEFlags::X);
    assert_eq!(PhysAddr::from(trampoline.ppn()).0, layout.trampoline);
    for va in [layout.uart0, layout.virtio0, layout.plic.0] {
        let device = page_table.translate(VirtAddr::from(va).floor()).unwrap();
        assert!(!device.user_accessible());
        assert!(!device.executable());
    }
}

pub fn remap_test(layout: &KernelLayout) {
    check_layout(kernel_pagetable(), layout);
    println!("[kernel] remap_test passed!");
}

/// 每个进程一份的内核页表:
/// 固定的内核区域 + 进程用户空间的镜像(去掉 U 位) + 这个进程自己的内核栈。
/// 只拥有页表页帧和内核栈页帧, 其余叶子页帧都是借来的。
pub struct KernelMirror {
    page_table: PageTable,
}

impl KernelMirror {
    /// 重新建一份和全局内核页表相同的固定映射, 不与全局页表共享任何页表页帧
    pub fn create_for_process(layout: &KernelLayout, allocator: &mut dyn FrameAllocator) -> VmResult<Self> {
        let mut page_table = PageTable::new(allocator)?;
        for region in layout.mirror_regions().iter() {
            if let Err(err) = page_table.map_range(region.va, region.size, region.pa, region.perm, allocator) {
                warn!("kernel mirror: mapping {} failed: {}", region.name, err);
                page_table.discard(allocator);
                return Err(err);
            }
        }
        debug!("kernel mirror created, root {:?}", page_table.root_ppn());
        Ok(Self { page_table })
    }
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }
    pub fn token(&self) -> usize {
        self.page_table.token()
    }
    pub fn activate(&self) {
        self.page_table.activate()
    }

    /// 分配并清零进程私有的内核栈页, 以 R/W 映射在 kstack_va
    pub fn map_kernel_stack(&mut self, kstack_va: VirtAddr, allocator: &mut dyn FrameAllocator) -> VmResult<()> {
        let frame = alloc_zeroed(allocator).ok_or(VmError::OutOfMemory)?;
        if let Err(err) = self.page_table.map(kstack_va.floor(), frame, PTEFlags::R | PTEFlags::W, allocator) {
            allocator.dealloc(frame);
            return Err(err);
        }
        trace!("kernel stack {:?} -> {:?}", kstack_va, frame);
        Ok(())
    }

    /// 把用户页表中 [round_up(va), va + size) 已经存在的页面抄进镜像, 去掉 U 位。
    /// 源页表里缺页是调用者的错误; 分配失败时本次抄进来的映射全部撤掉。
    pub fn sync_user_region(
        &mut self,
        user: &PageTable,
        va: usize,
        size: usize,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<()> {
        let start = page_round_up(va);
        let end = va + size;
        let mut a = start;
        while a < end {
            let vpn = VirtAddr::from(a).floor();
            let pte = match user.translate(vpn) {
                Some(pte) => pte,
                None => panic!("sync: pte not present at {:?}", vpn),
            };
            if let Err(err) = self.page_table.map(vpn, pte.ppn(), pte.flags() & !PTEFlags::U, allocator) {
                warn!("sync: {} at {:#x}, undoing [{:#x}, {:#x})", err, a, start, a);
                self.page_table.unmap_range(start.into(), (a - start) / PAGE_SIZE, false, allocator);
                return Err(err);
            }
            a += PAGE_SIZE;
        }
        Ok(())
    }

    /// 用户空间从 old_size 缩小到 new_size 之后, 去掉镜像里多出来的页面, 不释放页帧
    pub fn unsync_user_region(&mut self, old_size: usize, new_size: usize, allocator: &mut dyn FrameAllocator) {
        let new_top = page_round_up(new_size);
        let old_top = page_round_up(old_size);
        if new_top < old_top {
            self.page_table
                .unmap_range(new_top.into(), (old_top - new_top) / PAGE_SIZE, false, allocator);
        }
    }

    /// 通过镜像把内核虚拟地址翻译成物理地址, 页内偏移保持不变
    pub fn translate_kernel(&self, va: VirtAddr) -> PhysAddr {
        match self.page_table.translate(va.floor()) {
            Some(pte) if pte.is_leaf() => {
                let pa: PhysAddr = pte.ppn().into();
                PhysAddr(pa.0 + va.page_offset())
            }
            _ => panic!("translate_kernel: {:?} not mapped", va),
        }
    }

    /// 进程退出时拆掉镜像。
    /// 固定区域和用户区域只删映射; 内核栈页归镜像所有, 在这里释放且只释放一次。
    pub fn destroy_for_process(
        mut self,
        layout: &KernelLayout,
        kstack_va: VirtAddr,
        user_size: usize,
        allocator: &mut dyn FrameAllocator,
    ) {
        for region in layout.mirror_regions().iter() {
            self.page_table
                .unmap_range(region.va, page_round_up(region.size) / PAGE_SIZE, false, allocator);
        }
        if user_size > 0 {
            self.page_table
                .unmap_range(VirtAddr(0), page_round_up(user_size) / PAGE_SIZE, false, allocator);
        }
        self.page_table.unmap(kstack_va.floor(), true, allocator);
        debug!("kernel mirror destroyed, root {:?}", self.page_table.root_ppn());
        self.page_table.free_subtree(allocator);
    }

    /// 丢弃一个还没有内核栈的镜像, 只回收页表页帧
    pub fn discard(self, allocator: &mut dyn FrameAllocator) {
        self.page_table.discard(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{kernel_stack_position, KERNBASE};
    use crate::mm::test_support::PhysArena;
    use crate::mm::{AddressSpace, VirtPageNum};
    use alloc::boxed::Box;

    fn layout() -> KernelLayout {
        KernelLayout::qemu(KERNBASE + 0x2_0000, KERNBASE + 0x1_0000)
    }

    fn kstack() -> VirtAddr {
        kernel_stack_position(0).0.into()
    }

    #[test]
    fn boot_table_has_expected_permissions() {
        let mut arena = PhysArena::new(256);
        let mut builder = KernelPageTableBuilder::new(&mut arena);
        builder.map_layout(&layout());
        let page_table = builder.build();
        check_layout(&page_table, &layout());
        let clint = page_table.translate(VirtAddr::from(layout().clint.0).floor()).unwrap();
        assert!(clint.writable());
        page_table.discard(&mut arena);
        assert_eq!(arena.usable_frames(), 256);
    }

    #[test]
    #[should_panic(expected = "kvmmap")]
    fn boot_mapping_failure_is_fatal() {
        let mut arena = PhysArena::new(4);
        let mut builder = KernelPageTableBuilder::new(&mut arena);
        builder.map_layout(&layout());
    }

    #[test]
    fn global_kernel_table() {
        // 整个测试进程里只有这一处发布全局内核页表, 它的页帧要活到进程结束
        let arena = Box::leak(Box::new(PhysArena::new(256)));
        let page_table = kvm_init(&layout(), arena);
        assert_eq!(kernel_pagetable().root_ppn(), page_table.root_ppn());
        kvm_init_hart();
        remap_test(&layout());
    }

    #[test]
    fn mirror_matches_boot_regions_except_clint() {
        let mut arena = PhysArena::new(256);
        let mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        let pt = mirror.page_table();
        check_layout(pt, &layout());
        assert!(pt.translate(VirtAddr::from(layout().clint.0).floor()).is_none());
        let uart = VirtAddr::from(layout().uart0 + 0x10);
        assert_eq!(mirror.translate_kernel(uart), PhysAddr(layout().uart0 + 0x10));
        mirror.discard(&mut arena);
        assert_eq!(arena.usable_frames(), 256);
    }

    #[test]
    fn failed_mirror_creation_releases_tables() {
        let mut arena = PhysArena::new(16);
        assert!(matches!(
            KernelMirror::create_for_process(&layout(), &mut arena),
            Err(VmError::OutOfMemory)
        ));
        assert_eq!(arena.usable_frames(), 16);
    }

    #[test]
    fn synced_page_drops_user_bit() {
        let mut arena = PhysArena::new(256);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        let mut mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        space.grow(PAGE_SIZE, &mut arena).unwrap();
        mirror
            .sync_user_region(space.page_table(), 0, space.size(), &mut arena)
            .unwrap();
        let user = space.page_table().translate(VirtPageNum(0)).unwrap();
        let kernel = mirror.page_table().translate(VirtPageNum(0)).unwrap();
        assert_eq!(kernel.ppn(), user.ppn());
        assert_eq!(kernel.permissions(), user.permissions() - PTEFlags::U);
        assert!(mirror.page_table().translate_user(VirtAddr(0)).is_none());
        assert_eq!(mirror.translate_kernel(VirtAddr(0x24)), PhysAddr(PhysAddr::from(user.ppn()).0 + 0x24));

        mirror.unsync_user_region(space.size(), 0, &mut arena);
        assert!(mirror.page_table().translate(VirtPageNum(0)).is_none());
        mirror.discard(&mut arena);
        space.destroy(&mut arena);
        assert_eq!(arena.usable_frames(), 256);
    }

    #[test]
    fn sync_starts_at_the_next_page_boundary() {
        let mut arena = PhysArena::new(256);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        let mut mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        space.grow(PAGE_SIZE + 1, &mut arena).unwrap();
        mirror.sync_user_region(space.page_table(), 0, PAGE_SIZE + 1, &mut arena).unwrap();
        space.grow(3 * PAGE_SIZE, &mut arena).unwrap();
        // 第 1 页已经抄过了, 再抄一次会 remap
        mirror
            .sync_user_region(space.page_table(), PAGE_SIZE + 1, 2 * PAGE_SIZE - 1, &mut arena)
            .unwrap();
        assert!(mirror.page_table().translate(VirtPageNum(2)).is_some());
        mirror.map_kernel_stack(kstack(), &mut arena).unwrap();
        mirror.destroy_for_process(&layout(), kstack(), space.size(), &mut arena);
        space.destroy(&mut arena);
        assert_eq!(arena.usable_frames(), 256);
    }

    #[test]
    fn sync_failing_on_a_table_frame_changes_nothing() {
        let mut arena = PhysArena::new(1024);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(513 * PAGE_SIZE, &mut arena).unwrap();
        let mut mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();

        // 第 0 页就要一个新的最底层页表
        let reserved = arena.reserve_all_but(0);
        assert_eq!(
            mirror.sync_user_region(space.page_table(), 0, space.size(), &mut arena),
            Err(VmError::OutOfMemory)
        );
        assert!(mirror.page_table().translate(VirtPageNum(0)).is_none());
        arena.release(reserved);

        // 前 512 页抄进去了, 第 512 页的最底层页表拿不到
        let reserved = arena.reserve_all_but(1);
        assert_eq!(
            mirror.sync_user_region(space.page_table(), 0, space.size(), &mut arena),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(arena.usable_frames(), 1);
        assert!(mirror.page_table().translate(VirtPageNum(0)).is_none());
        assert!(mirror.page_table().translate(VirtPageNum(512)).is_none());
        arena.release(reserved);

        mirror.discard(&mut arena);
        space.destroy(&mut arena);
        assert_eq!(arena.usable_frames(), 1024);
    }

    #[test]
    #[should_panic(expected = "sync: pte not present")]
    fn syncing_uncommitted_range_is_fatal() {
        let mut arena = PhysArena::new(256);
        let space = AddressSpace::new(&mut arena).unwrap();
        let mut mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        let _ = mirror.sync_user_region(space.page_table(), 0, PAGE_SIZE, &mut arena);
    }

    #[test]
    fn destroy_frees_only_owned_frames() {
        let mut arena = PhysArena::new(256);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(2 * PAGE_SIZE, &mut arena).unwrap();
        let after_grow = arena.usable_frames();

        let mut mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        mirror.map_kernel_stack(kstack(), &mut arena).unwrap();
        let stack = mirror.translate_kernel(kstack());
        assert!(stack.floor().get_bytes_array().iter().all(|&b| b == 0));
        mirror
            .sync_user_region(space.page_table(), 0, space.size(), &mut arena)
            .unwrap();
        mirror.destroy_for_process(&layout(), kstack(), space.size(), &mut arena);

        // 用户页帧还在, 镜像自己的页帧和内核栈都还回去了
        assert_eq!(arena.usable_frames(), after_grow);
        assert!(space.page_table().translate(VirtPageNum(1)).is_some());
        space.destroy(&mut arena);
        assert_eq!(arena.usable_frames(), 256);
    }

    #[test]
    #[should_panic(expected = "translate_kernel")]
    fn translating_unmapped_kernel_address_is_fatal() {
        let mut arena = PhysArena::new(256);
        let mirror = KernelMirror::create_for_process(&layout(), &mut arena).unwrap();
        mirror.translate_kernel(kstack());
    }
}
