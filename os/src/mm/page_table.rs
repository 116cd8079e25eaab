use super::{alloc_zeroed, FrameAllocator, PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
use crate::config::{PAGE_SIZE, PTES_PER_TABLE};
use crate::error::{VmError, VmResult};
use bitflags::*;
use core::fmt::{self, Debug, Display, Formatter};

bitflags! {
    // 将一个 u8 封装成一个标志位的集合类型
    pub struct PTEFlags: u8 {
        const V = 1 << 0; // 仅当 V(Valid) 位为 1 时，页表项才是合法的
        const R = 1 << 1; // R/W/X 分别控制索引到这个页表项的对应虚拟页面是否允许 读/写/取指
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4; // 控制索引到这个页表项的对应虚拟页面是否在 CPU 处于 U 特权级的情况下是否被允许访问
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
    // 当 V 为 1 且 R/W/X 均为 0 时，表示是一个合法的页目录表项，其包含的指针会指向下一级的页表
    // 当 V 为 1 且 R/W/X 不全为 0 时，表示是一个合法的页表项，其包含了虚地址对应的物理页号
}

// 页表项 (PTE, Page Table Entry)
// 原始的 usize 不对外暴露, 只能通过下面的访问器读取
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    // 从一个物理页号 PhysPageNum 和一个页表项标志位 PTEFlags 生成一个页表项 PageTableEntry 实例
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    // 生成一个全零的页表项, 隐含着该页表项的 V 标志位为 0，因此它是不合法的
    pub fn empty() -> Self {
        PageTableEntry {
            bits: 0,
        }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    /// 只保留 R/W/X/U 四个权限位
    pub fn permissions(&self) -> PTEFlags {
        self.flags() & (PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    // 叶子: 至少有 R/W/X 中的一个
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }
    // 中间节点: 合法但 R/W/X 全为 0, 指向下一级页表
    pub fn is_internal(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
    pub fn user_accessible(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
    pub fn remove_flags(&mut self, flags: PTEFlags) {
        self.bits &= !(flags.bits() as usize);
    }
    pub(crate) fn bits(&self) -> usize {
        self.bits
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PTE:{:#x}", self.bits))
    }
}

// 每个地址空间都对应一个不同的多级页表, 用根节点的物理页号 root_ppn 区分
// 页表页帧和数据页帧都不自动回收, 由地址空间和内核镜像各自负责释放
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    /// 分配一个清零的根页帧; 物理页帧耗尽时返回错误而不是 panic
    pub fn new(allocator: &mut dyn FrameAllocator) -> VmResult<Self> {
        let root_ppn = alloc_zeroed(allocator).ok_or(VmError::OutOfMemory)?;
        Ok(PageTable { root_ppn })
    }
    /// 从 satp 的值还原出页表, 只用来查看已经装进 satp 的页表
    pub fn from_token(satp: usize) -> Self {
        Self {
            root_ppn: PhysPageNum::from(satp & ((1usize << 44) - 1)),
        }
    }
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }
    // SV39 模式 + 根节点物理页号
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }
    /// 把 satp 切换到这张页表, 并立刻刷新整个快表
    pub fn activate(&self) {
        let satp = self.token();
        // 一旦修改了 satp, 快表中的键值对就会失效, sfence.vma 必须紧跟其后
        #[cfg(target_arch = "riscv64")]
        unsafe {
            riscv::register::satp::write(satp);
            riscv::asm::sfence_vma_all();
        }
        trace!("activate page table satp={:#x}", satp);
    }

    // 逐级向下, 返回最底层页表中 va 对应的页表项
    // 传入分配器时顺便创建缺失的中间页表, 分配失败返回 None
    fn walk(
        &self,
        va: VirtAddr,
        mut allocator: Option<&mut dyn FrameAllocator>,
    ) -> Option<&'static mut PageTableEntry> {
        assert!(va.is_valid(), "walk: {:?} out of range", va);
        let idxs = va.floor().indexes();
        let mut ppn = self.root_ppn; // 当前节点的物理页号, 最开始指向多级页表的根节点
        for (level, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if level == 2 {
                return Some(pte);
            }
            if !pte.is_valid() {
                let frame = alloc_zeroed(allocator.as_deref_mut()?)?;
                *pte = PageTableEntry::new(frame, PTEFlags::V);
            }
            assert!(!pte.is_leaf(), "walk: unexpected leaf {:?} at {:?}", pte, va);
            ppn = pte.ppn();
        }
        unreachable!()
    }
    // 从 va 找页表项, 找不到的时候就创建
    pub(crate) fn find_pte_create(
        &mut self,
        va: VirtAddr,
        allocator: &mut dyn FrameAllocator,
    ) -> Option<&mut PageTableEntry> {
        self.walk(va, Some(allocator))
    }
    // 从 va 找页表项, 找不到的时候就返回 None
    pub(crate) fn find_pte(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        self.walk(va, None).map(|pte| &*pte)
    }
    fn find_pte_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        self.walk(va, None)
    }

    /// 如果能找到合法的页表项，就拷贝一份返回
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn.into())
            .filter(|pte| pte.is_valid())
            .copied()
    }
    /// 只用于翻译用户给的地址: 必须是合法的叶子且带 U 位, 否则返回 None,
    /// 防止内核替用户访问到特权映射。超出 MAXVA 的地址同样返回 None。
    pub fn translate_user(&self, va: VirtAddr) -> Option<PhysAddr> {
        if !va.is_valid() {
            return None;
        }
        let pte = self.find_pte(va)?;
        if !pte.is_leaf() || !pte.user_accessible() {
            return None;
        }
        let pa: PhysAddr = pte.ppn().into();
        Some(PhysAddr(pa.0 + va.page_offset()))
    }

    // 在多级页表中插入一个 <虚拟页号，物理页号> 键值对
    // 覆盖一个已经合法的页表项一定是调用者的逻辑错误
    // 中间页表分配失败时, 这一次新建的、仍然为空的下级页表会被回收
    pub fn map(
        &mut self,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        flags: PTEFlags,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<()> {
        let pte = match self.find_pte_create(vpn.into(), allocator) {
            Some(pte) => pte,
            None => {
                self.prune(vpn, allocator);
                return Err(VmError::OutOfMemory);
            }
        };
        assert!(!pte.is_valid(), "remap: {:?} is mapped before mapping", vpn);
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }
    /// 为 [va, va + size) 覆盖到的每一页建立到 pa 开始的连续物理页的映射。
    /// va 和 size 不必页对齐。中途分配失败时已经装上的映射不回滚, 由调用者处理。
    pub fn map_range(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        flags: PTEFlags,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<()> {
        assert!(size > 0, "map_range: size");
        let mut vpn = va.floor();
        let last = VirtAddr::from(va.0 + size - 1).floor();
        let mut ppn = pa.floor();
        loop {
            self.map(vpn, ppn, flags, allocator)?;
            if vpn == last {
                break;
            }
            vpn.step();
            ppn.step();
        }
        Ok(())
    }

    // 删除一个 <虚拟页号，物理页号> 键值对, free 为 true 时同时归还物理页帧
    pub fn unmap(&mut self, vpn: VirtPageNum, free: bool, allocator: &mut dyn FrameAllocator) {
        let pte = match self.find_pte_mut(vpn.into()) {
            Some(pte) => pte,
            None => panic!("unmap: walk {:?}", vpn),
        };
        assert!(pte.is_valid(), "unmap: {:?} not mapped", vpn);
        assert!(pte.is_leaf(), "unmap: {:?} not a leaf", vpn);
        if free {
            allocator.dealloc(pte.ppn());
        }
        *pte = PageTableEntry::empty();
    }
    /// 从对齐的 va 开始删除 pages 个映射, 这些映射必须都存在。
    /// 变空的下级页表会被顺带回收。
    pub fn unmap_range(
        &mut self,
        va: VirtAddr,
        pages: usize,
        free: bool,
        allocator: &mut dyn FrameAllocator,
    ) {
        assert!(va.aligned(), "unmap: {:?} not aligned", va);
        let start = va.floor();
        let end = VirtPageNum(start.0 + pages);
        for vpn in VPNRange::new(start, end) {
            self.unmap(vpn, free, allocator);
            // 走完一个最底层页表覆盖的范围(或者整个区间)之后, 看看它是否已经空了
            let next = vpn.0 + 1;
            if next % PTES_PER_TABLE == 0 || next == end.0 {
                self.prune(vpn, allocator);
            }
        }
    }
    // 回收 vpn 所在路径上已经没有任何合法项的下级页表, 根节点除外
    // 路径可能只建了一半: 有第二级页表而没有最底层页表
    fn prune(&mut self, vpn: VirtPageNum, allocator: &mut dyn FrameAllocator) {
        let idxs = vpn.indexes();
        let l2 = self.root_ppn.get_pte_array();
        let l2_pte = &mut l2[idxs[0]];
        if !l2_pte.is_internal() {
            return;
        }
        let l1 = l2_pte.ppn().get_pte_array();
        let l1_pte = &mut l1[idxs[1]];
        if l1_pte.is_internal() {
            let l0_ppn = l1_pte.ppn();
            if l0_ppn.get_pte_array().iter().any(|pte| pte.is_valid()) {
                return;
            }
            allocator.dealloc(l0_ppn);
            *l1_pte = PageTableEntry::empty();
        }
        if l1.iter().any(|pte| pte.is_valid()) {
            return;
        }
        allocator.dealloc(l2_pte.ppn());
        *l2_pte = PageTableEntry::empty();
    }

    /// 去掉一个已存在的叶子的 U 位, 用来做用户栈下面的保护页
    pub fn clear_user(&mut self, va: VirtAddr) {
        match self.find_pte_mut(va) {
            Some(pte) if pte.is_valid() => pte.remove_flags(PTEFlags::U),
            _ => panic!("clear_user: {:?} not mapped", va),
        }
    }

    /// 后序递归回收所有页表页帧(包括根节点)。
    /// 叶子映射必须事先全部删除, 残留的叶子说明调用者忘了 unmap。
    pub fn free_subtree(self, allocator: &mut dyn FrameAllocator) {
        release_table(self.root_ppn, 2, false, allocator);
    }
    /// 不释放任何叶子页帧, 直接丢弃叶子映射并回收页表页帧。
    /// 只用于页表从未拥有过叶子页帧的情况, 比如回滚一个半成品的内核镜像。
    pub fn discard(self, allocator: &mut dyn FrameAllocator) {
        release_table(self.root_ppn, 2, true, allocator);
    }

    pub fn dump(&self) -> PageTableDump<'_> {
        PageTableDump { page_table: self }
    }
}

fn release_table(ppn: PhysPageNum, level: usize, forget_leaves: bool, allocator: &mut dyn FrameAllocator) {
    // there are 2^9 = 512 PTEs in a page table.
    for pte in ppn.get_pte_array().iter_mut() {
        if pte.is_leaf() || (level == 0 && pte.is_valid()) {
            assert!(forget_leaves, "free_subtree: leaf {:?}", pte);
        } else if pte.is_internal() {
            release_table(pte.ppn(), level - 1, forget_leaves, allocator);
        } else {
            continue;
        }
        *pte = PageTableEntry::empty();
    }
    allocator.dealloc(ppn);
}

/// `PageTable::dump` 的结果, 按层打印所有合法页表项
pub struct PageTableDump<'a> {
    page_table: &'a PageTable,
}

impl Display for PageTableDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let root: PhysAddr = self.page_table.root_ppn.into();
        writeln!(f, "page table {:#x}", root.0)?;
        dump_level(f, self.page_table.root_ppn, 0)
    }
}

fn dump_level(f: &mut Formatter<'_>, ppn: PhysPageNum, depth: usize) -> fmt::Result {
    for (i, pte) in ppn.get_pte_array().iter().enumerate() {
        if !pte.is_valid() {
            continue;
        }
        f.write_str("..")?;
        for _ in 0..depth {
            f.write_str(" ..")?;
        }
        let pa: PhysAddr = pte.ppn().into();
        writeln!(f, "{}: pte {:#x} pa {:#x}", i, pte.bits(), pa.0)?;
        // 只有中间节点才继续往下走
        if pte.is_internal() && depth < 2 {
            dump_level(f, pte.ppn(), depth + 1)?;
        }
    }
    Ok(())
}

/// 打印一张页表的结构, 调试用
pub fn vmprint(page_table: &PageTable) {
    print!("{}", page_table.dump());
}

// 一个页表恰好占满一个物理页帧
const _: () = assert!(PAGE_SIZE == PTES_PER_TABLE * core::mem::size_of::<PageTableEntry>());
