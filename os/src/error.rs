use crate::mm::VirtAddr;

/// 可以交还给调用者处理的错误; 违反不变量的情况直接 panic, 不走这里
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("bad user address {0:?}")]
    BadAddress(VirtAddr),
    #[error("no null terminator within bound")]
    NoTerminator,
    #[error("process size limit exceeded")]
    SizeLimit,
}

pub type VmResult<T> = Result<T, VmError>;
