#![allow(unused)]

const SBI_CONSOLE_PUTCHAR: usize = 1;

#[cfg(target_arch = "riscv64")]
#[inline(always)]
fn sbi_call(which: usize, arg0: usize, arg1: usize, arg2: usize) -> usize {
    let mut ret;
    unsafe {
        // trap 到更高的特权级执行 SBI 调用，这里是 S -> M
        core::arch::asm!(
            "ecall",
            inlateout("x10") arg0 => ret,
            in("x11") arg1,
            in("x12") arg2,
            in("x17") which,
        );
    }
    ret
}

// 宿主机上没有 RustSBI，测试时把控制台输出转给宿主的 stdout
#[cfg(not(target_arch = "riscv64"))]
fn sbi_call(which: usize, arg0: usize, _arg1: usize, _arg2: usize) -> usize {
    #[cfg(test)]
    if which == SBI_CONSOLE_PUTCHAR {
        std::print!("{}", arg0 as u8 as char);
    }
    let _ = (which, arg0);
    0
}

pub fn console_putchar(c: usize) {
    sbi_call(SBI_CONSOLE_PUTCHAR, c, 0, 0);
}
