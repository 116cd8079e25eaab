//! 教学内核的虚存子系统: SV39 三级页表、用户地址空间、每进程内核页表镜像，
//! 以及在用户/内核地址空间之间搬运数据的拷贝原语。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

#[macro_use]
pub mod console;
pub mod config;
pub mod error;
pub mod logging;
pub mod mm;
mod sbi;

pub use error::{VmError, VmResult};
