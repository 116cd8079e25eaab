use super::{AddressSpace, FrameAllocator, KernelMirror, VirtAddr};
use crate::config::{KernelLayout, PAGE_SIZE};
use crate::error::{VmError, VmResult};

/// 一个进程的全部内存: 用户地址空间、内核页表镜像、内核栈的位置。
/// 镜像里的用户区域始终和 space 的 [0, size) 保持一致。
pub struct ProcessMemory {
    space: AddressSpace,
    mirror: KernelMirror,
    kstack: VirtAddr,
    user_limit: usize,
}

impl ProcessMemory {
    /// 空的用户页表 + 新的内核镜像 + 内核栈, 任何一步失败都会把已经建好的部分拆掉
    pub fn new(layout: &KernelLayout, kstack: VirtAddr, allocator: &mut dyn FrameAllocator) -> VmResult<Self> {
        let space = AddressSpace::new(allocator)?;
        let mirror = match Self::mirror_with_stack(layout, kstack, allocator) {
            Ok(mirror) => mirror,
            Err(err) => {
                space.destroy(allocator);
                return Err(err);
            }
        };
        Ok(Self {
            space,
            mirror,
            kstack,
            user_limit: layout.user_limit(),
        })
    }

    fn mirror_with_stack(
        layout: &KernelLayout,
        kstack: VirtAddr,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<KernelMirror> {
        let mut mirror = KernelMirror::create_for_process(layout, allocator)?;
        if let Err(err) = mirror.map_kernel_stack(kstack, allocator) {
            mirror.discard(allocator);
            return Err(err);
        }
        Ok(mirror)
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }
    pub fn mirror(&self) -> &KernelMirror {
        &self.mirror
    }
    pub fn kstack(&self) -> VirtAddr {
        self.kstack
    }
    pub fn size(&self) -> usize {
        self.space.size()
    }

    // userinit
    pub fn init_first(&mut self, image: &[u8], allocator: &mut dyn FrameAllocator) -> VmResult<()> {
        self.space.init_first(image, allocator)?;
        if let Err(err) = self.mirror.sync_user_region(self.space.page_table(), 0, PAGE_SIZE, allocator) {
            self.space.shrink(0, allocator);
            return Err(err);
        }
        Ok(())
    }

    /// sbrk: 把进程大小改变 n 个字节, 返回原来的大小。
    /// 不能长过 user_limit, 否则会和镜像里的内核映射重叠; 也不能缩到 0 以下。
    pub fn grow_by(&mut self, n: isize, allocator: &mut dyn FrameAllocator) -> VmResult<usize> {
        let old_size = self.space.size();
        if n > 0 {
            let new_size = old_size
                .checked_add(n as usize)
                .filter(|&size| size <= self.user_limit)
                .ok_or(VmError::SizeLimit)?;
            self.space.grow(new_size, allocator)?;
            if let Err(err) =
                self.mirror
                    .sync_user_region(self.space.page_table(), old_size, new_size - old_size, allocator)
            {
                self.space.shrink(old_size, allocator);
                return Err(err);
            }
        } else if n < 0 {
            let new_size = old_size
                .checked_sub(n.unsigned_abs())
                .ok_or(VmError::SizeLimit)?;
            // 先撤掉镜像, 再释放页帧
            self.mirror.unsync_user_region(old_size, new_size, allocator);
            self.space.shrink(new_size, allocator);
        }
        Ok(old_size)
    }

    /// 复制出子进程的内存, 子进程的镜像同步整个用户空间
    pub fn fork(
        &self,
        layout: &KernelLayout,
        kstack: VirtAddr,
        allocator: &mut dyn FrameAllocator,
    ) -> VmResult<ProcessMemory> {
        let space = self.space.fork(allocator)?;
        let mut mirror = match Self::mirror_with_stack(layout, kstack, allocator) {
            Ok(mirror) => mirror,
            Err(err) => {
                space.destroy(allocator);
                return Err(err);
            }
        };
        if let Err(err) = mirror.sync_user_region(space.page_table(), 0, space.size(), allocator) {
            mirror.destroy_for_process(layout, kstack, 0, allocator);
            space.destroy(allocator);
            return Err(err);
        }
        Ok(ProcessMemory {
            space,
            mirror,
            kstack,
            user_limit: self.user_limit,
        })
    }

    /// exec: 换上新的用户地址空间, 旧的销毁。
    /// 同步新空间失败时恢复旧的镜像, 进程保持原样。
    pub fn replace_space(&mut self, new_space: AddressSpace, allocator: &mut dyn FrameAllocator) -> VmResult<()> {
        if new_space.size() > self.user_limit {
            new_space.destroy(allocator);
            return Err(VmError::SizeLimit);
        }
        let old_size = self.space.size();
        self.mirror.unsync_user_region(old_size, 0, allocator);
        if let Err(err) = self.mirror.sync_user_region(new_space.page_table(), 0, new_space.size(), allocator) {
            new_space.destroy(allocator);
            if self
                .mirror
                .sync_user_region(self.space.page_table(), 0, old_size, allocator)
                .is_err()
            {
                panic!("exec: cannot restore kernel mirror");
            }
            return Err(err);
        }
        let old_space = core::mem::replace(&mut self.space, new_space);
        old_space.destroy(allocator);
        debug!("exec: user space replaced, {:#x} -> {:#x}", old_size, self.space.size());
        Ok(())
    }

    /// 先拆镜像(内核栈随之释放), 再释放用户空间
    pub fn free(self, layout: &KernelLayout, allocator: &mut dyn FrameAllocator) {
        self.mirror
            .destroy_for_process(layout, self.kstack, self.space.size(), allocator);
        self.space.destroy(allocator);
    }
}
