use super::{alloc_zeroed, page_round_up, FrameAllocator, PTEFlags, PageTable, PhysAddr, VirtAddr, VirtPageNum};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};

// 用户页面一律 R/W/X/U
fn user_rwx() -> PTEFlags {
    PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U
}

// 按字节大小管理用户地址空间 [0, size) 的那部分操作
impl PageTable {
    /// 为第一个进程在虚拟地址 0 处映射一页并放入初始程序, 程序必须小于一页
    pub fn init_first(&mut self, image: &[u8], allocator: &mut dyn FrameAllocator) -> VmResult<()> {
        assert!(image.len() < PAGE_SIZE, "init_first: more than a page");
        let frame = alloc_zeroed(allocator).ok_or(VmError::OutOfMemory)?;
        if let Err(err) = self.map(VirtPageNum(0), frame, user_rwx(), allocator) {
            allocator.dealloc(frame);
            return Err(err);
        }
        frame.get_bytes_array()[..image.len()].copy_from_slice(image);
        Ok(())
    }

    /// 把用户空间从 old_size 扩展到 new_size, 两者都不必页对齐。
    /// 中途失败时回滚本次新分配的全部页面, 地址空间保持调用前的样子。
    pub fn grow_user(
        &mut self,
        old_size: usize,
        new_size: usize,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<usize> {
        if new_size <= old_size {
            return Ok(old_size);
        }
        let start = page_round_up(old_size);
        let mut va = start;
        while va < new_size {
            let result = match alloc_zeroed(allocator) {
                Some(frame) => self
                    .map(VirtAddr::from(va).floor(), frame, user_rwx(), allocator)
                    .map_err(|err| {
                        allocator.dealloc(frame);
                        err
                    }),
                None => Err(VmError::OutOfMemory),
            };
            if let Err(err) = result {
                warn!("grow: {:?} at {:#x}, rolling back to {:#x}", err, va, start);
                self.shrink_user(va, start, allocator);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(new_size)
    }

    /// 把用户空间从 old_size 缩小到 new_size, 释放不再需要的整页。
    /// 返回的是 new_size 本身, 只有页帧的边界是取整过的。
    pub fn shrink_user(
        &mut self,
        old_size: usize,
        new_size: usize,
        allocator: &mut dyn FrameAllocator,
    ) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let new_top = page_round_up(new_size);
        let old_top = page_round_up(old_size);
        if new_top < old_top {
            let pages = (old_top - new_top) / PAGE_SIZE;
            self.unmap_range(new_top.into(), pages, true, allocator);
        }
        new_size
    }

    /// fork 时把 [0, size) 的每一页连同内容复制到 dst 中, 权限保持一致。
    /// 这是立即的深拷贝; 失败时 dst 中已经装上的页面全部释放, 源页表不受影响。
    pub fn copy_user(
        &self,
        dst: &mut PageTable,
        size: usize,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<()> {
        let mut va = 0;
        while va < size {
            let vpn = VirtAddr::from(va).floor();
            let pte = match self.translate(vpn) {
                Some(pte) => pte,
                None => panic!("copy_user: {:?} not present", vpn),
            };
            let result = match allocator.alloc() {
                Some(frame) => {
                    // 整页覆盖, 不需要先清零
                    frame.get_bytes_array().copy_from_slice(pte.ppn().get_bytes_array());
                    dst.map(vpn, frame, pte.flags(), allocator).map_err(|err| {
                        allocator.dealloc(frame);
                        err
                    })
                }
                None => Err(VmError::OutOfMemory),
            };
            if let Err(err) = result {
                warn!("copy_user: {:?} at {:#x}, releasing the copy", err, va);
                dst.unmap_range(VirtAddr(0), va / PAGE_SIZE, true, allocator);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// 释放 [0, size) 的用户页面, 然后释放所有页表页帧
    pub fn free_user(mut self, size: usize, allocator: &mut dyn FrameAllocator) {
        if size > 0 {
            self.unmap_range(VirtAddr(0), page_round_up(size) / PAGE_SIZE, true, allocator);
        }
        self.free_subtree(allocator);
    }
}

// 一个进程的用户地址空间: 页表 + 当前大小
// 页表以及 [0, size) 中所有叶子页帧都归它所有
pub struct AddressSpace {
    page_table: PageTable,
    size: usize,
}

impl AddressSpace {
    pub fn new(allocator: &mut dyn FrameAllocator) -> VmResult<Self> {
        let page_table = PageTable::new(allocator)?;
        debug!("address space created, root {:?}", page_table.root_ppn());
        Ok(Self {
            page_table,
            size: 0,
        })
    }
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn token(&self) -> usize {
        self.page_table.token()
    }
    pub fn activate(&self) {
        self.page_table.activate()
    }
    pub fn translate_user(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table.translate_user(va)
    }
    pub fn init_first(&mut self, image: &[u8], allocator: &mut dyn FrameAllocator) -> VmResult<()> {
        assert_eq!(self.size, 0, "init_first: address space in use");
        self.page_table.init_first(image, allocator)?;
        self.size = PAGE_SIZE;
        Ok(())
    }
    pub fn grow(&mut self, new_size: usize, allocator: &mut dyn FrameAllocator) -> VmResult<usize> {
        self.size = self.page_table.grow_user(self.size, new_size, allocator)?;
        debug!("address space grown to {:#x}", self.size);
        Ok(self.size)
    }
    pub fn shrink(&mut self, new_size: usize, allocator: &mut dyn FrameAllocator) -> usize {
        self.size = self.page_table.shrink_user(self.size, new_size, allocator);
        debug!("address space shrunk to {:#x}", self.size);
        self.size
    }
    /// 复制出一个内容相同但物理上独立的地址空间
    pub fn fork(&self, allocator: &mut dyn FrameAllocator) -> VmResult<AddressSpace> {
        let mut child = AddressSpace::new(allocator)?;
        if let Err(err) = self.page_table.copy_user(&mut child.page_table, self.size, allocator) {
            child.page_table.free_subtree(allocator);
            return Err(err);
        }
        child.size = self.size;
        debug!("address space forked, {:#x} bytes", self.size);
        Ok(child)
    }
    pub fn clear_user(&mut self, va: VirtAddr) {
        self.page_table.clear_user(va)
    }
    pub fn destroy(self, allocator: &mut dyn FrameAllocator) {
        debug!("address space destroyed, {:#x} bytes", self.size);
        self.page_table.free_user(self.size, allocator);
    }
}
