use crate::mm::{PhysAddr, PTEFlags, VirtAddr};

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;
// 一个页表页帧里恰好放 512 个 8 字节的页表项
pub const PTES_PER_TABLE: usize = 512;

// SV39 的虚拟地址有 39 位, 这里只用 38 位, 避免最高位带来的符号扩展
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
// 跳板放在最高的一个虚拟页面中, 每个地址空间都一样
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE;

// qemu virt 板子上的物理内存布局
pub const UART0: usize = 0x1000_0000;
pub const VIRTIO0: usize = 0x1000_1000;
pub const CLINT: usize = 0x0200_0000;
pub const CLINT_SIZE: usize = 0x1_0000;
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Return (bottom, top) of a kernel stack in kernel space.
pub fn kernel_stack_position(app_id: usize) -> (usize, usize) {
    let top = TRAMPOLINE - app_id * (KERNEL_STACK_SIZE + PAGE_SIZE);
    let bottom = top - KERNEL_STACK_SIZE;
    (bottom, top)
}

/// 内核里一段固定的恒等映射 (跳板除外)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelRegion {
    pub name: &'static str,
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub size: usize,
    pub perm: PTEFlags,
}

/// 启动时由链接脚本和板级常量决定的内核布局。
/// `etext` 和跳板的物理地址来自链接脚本, 其余来自上面的常量。
#[derive(Copy, Clone, Debug)]
pub struct KernelLayout {
    pub uart0: usize,
    pub virtio0: usize,
    pub clint: (usize, usize),
    pub plic: (usize, usize),
    pub kernbase: usize,
    pub etext: usize,
    pub phystop: usize,
    pub trampoline: usize,
}

impl KernelLayout {
    pub fn qemu(etext: usize, trampoline: usize) -> Self {
        assert!(etext % PAGE_SIZE == 0, "etext {:#x} is not page aligned", etext);
        assert!(trampoline % PAGE_SIZE == 0, "trampoline {:#x} is not page aligned", trampoline);
        Self {
            uart0: UART0,
            virtio0: VIRTIO0,
            clint: (CLINT, CLINT_SIZE),
            plic: (PLIC, PLIC_SIZE),
            kernbase: KERNBASE,
            etext,
            phystop: PHYSTOP,
            trampoline,
        }
    }

    /// 全局内核页表需要的全部映射
    pub fn boot_regions(&self) -> [KernelRegion; 7] {
        let [uart, virtio, plic, text, data, trampoline] = self.mirror_regions();
        [
            uart,
            virtio,
            identical("clint", self.clint.0, self.clint.1, PTEFlags::R | PTEFlags::W),
            plic,
            text,
            data,
            trampoline,
        ]
    }

    /// 每个进程的内核页表镜像需要的映射。
    /// 不映射 CLINT: 它在 PLIC 之下, 用户空间最多可以长到 PLIC。
    pub fn mirror_regions(&self) -> [KernelRegion; 6] {
        [
            identical("uart0", self.uart0, PAGE_SIZE, PTEFlags::R | PTEFlags::W),
            identical("virtio0", self.virtio0, PAGE_SIZE, PTEFlags::R | PTEFlags::W),
            identical("plic", self.plic.0, self.plic.1, PTEFlags::R | PTEFlags::W),
            // 内核代码段只读可执行
            identical("kernel text", self.kernbase, self.etext - self.kernbase, PTEFlags::R | PTEFlags::X),
            // 内核数据段以及剩下可用的物理内存
            identical("kernel data", self.etext, self.phystop - self.etext, PTEFlags::R | PTEFlags::W),
            KernelRegion {
                name: "trampoline",
                va: TRAMPOLINE.into(),
                pa: self.trampoline.into(),
                size: PAGE_SIZE,
                perm: PTEFlags::R | PTEFlags::X,
            },
        ]
    }

    /// 用户地址空间的上限, 即镜像里最低的内核虚拟地址
    pub fn user_limit(&self) -> usize {
        self.plic.0
    }
}

fn identical(name: &'static str, base: usize, size: usize, perm: PTEFlags) -> KernelRegion {
    KernelRegion {
        name,
        va: base.into(),
        pa: base.into(),
        size,
        perm,
    }
}
