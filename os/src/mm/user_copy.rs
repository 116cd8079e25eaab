use super::{PageTable, VirtAddr};
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};

/// 把用户空间 [va, va + len) 按页切开, 每一段翻译成内核可以直接访问的字节切片。
/// 翻译是惰性的: 遇到不可访问的页面时才报错, 之前的段已经交出去了。
pub struct UserBuffer<'a> {
    page_table: &'a PageTable,
    start: usize,
    remaining: usize,
}

impl Iterator for UserBuffer<'_> {
    type Item = VmResult<&'static mut [u8]>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let va = VirtAddr::from(self.start);
        let pa = match self.page_table.translate_user(va) {
            Some(pa) => pa,
            None => {
                // 出错之后不再继续
                self.remaining = 0;
                return Some(Err(VmError::BadAddress(va)));
            }
        };
        // start 一定小于 MAXVA, 加上不到一页不会溢出
        let len = (PAGE_SIZE - va.page_offset()).min(self.remaining);
        self.start += len;
        self.remaining -= len;
        let offset = pa.page_offset();
        Some(Ok(&mut pa.floor().get_bytes_array()[offset..offset + len]))
    }
}

pub fn translated_byte_buffer(page_table: &PageTable, va: VirtAddr, len: usize) -> UserBuffer<'_> {
    UserBuffer {
        page_table,
        start: va.0,
        remaining: len,
    }
}

/// 从内核拷贝到用户空间。
/// 失败时失败页之前的字节已经写进去了, 不会回滚。
pub fn copy_out(page_table: &PageTable, dst_va: VirtAddr, src: &[u8]) -> VmResult<()> {
    let mut copied = 0;
    for chunk in translated_byte_buffer(page_table, dst_va, src.len()) {
        let chunk = chunk.map_err(|err| {
            warn!("copy_out: {}", err);
            err
        })?;
        chunk.copy_from_slice(&src[copied..copied + chunk.len()]);
        copied += chunk.len();
    }
    Ok(())
}

/// 从用户空间拷贝到内核, 拷满 dst 为止
pub fn copy_in(page_table: &PageTable, dst: &mut [u8], src_va: VirtAddr) -> VmResult<()> {
    let mut copied = 0;
    for chunk in translated_byte_buffer(page_table, src_va, dst.len()) {
        let chunk = chunk.map_err(|err| {
            warn!("copy_in: {}", err);
            err
        })?;
        dst[copied..copied + chunk.len()].copy_from_slice(chunk);
        copied += chunk.len();
    }
    Ok(())
}

/// 从用户空间拷贝一个以 0 结尾的字符串, 最多读 max 个字节(同时受 dst 长度限制)。
/// 结尾的 0 也写进 dst, 返回的是不含 0 的长度。
/// 边界内没有 0 时返回 NoTerminator, 这时 dst 里已经有部分内容了。
pub fn copy_in_string(
    page_table: &PageTable,
    dst: &mut [u8],
    src_va: VirtAddr,
    max: usize,
) -> VmResult<usize> {
    let max = max.min(dst.len());
    let mut copied = 0;
    for chunk in translated_byte_buffer(page_table, src_va, max) {
        let chunk = chunk.map_err(|err| {
            warn!("copy_in_string: {}", err);
            err
        })?;
        for &byte in chunk.iter() {
            dst[copied] = byte;
            if byte == 0 {
                return Ok(copied);
            }
            copied += 1;
        }
    }
    Err(VmError::NoTerminator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAXVA;
    use crate::mm::test_support::PhysArena;
    use crate::mm::AddressSpace;
    use alloc::vec::Vec;

    #[test]
    fn hello_across_a_page_boundary() {
        let mut arena = PhysArena::new(16);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        let before = arena.usable_frames();
        space.grow(8192, &mut arena).unwrap();
        copy_out(space.page_table(), VirtAddr(4097), b"hello").unwrap();
        let mut buf = [0u8; 5];
        copy_in(space.page_table(), &mut buf, VirtAddr(4097)).unwrap();
        assert_eq!(&buf, b"hello");
        space.shrink(0, &mut arena);
        assert_eq!(arena.usable_frames(), before);
        space.destroy(&mut arena);
    }

    #[test]
    fn multi_page_unaligned_round_trip() {
        let mut arena = PhysArena::new(16);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(4 * PAGE_SIZE, &mut arena).unwrap();
        let data: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        copy_out(space.page_table(), VirtAddr(100), &data).unwrap();
        let mut back = alloc::vec![0u8; data.len()];
        copy_in(space.page_table(), &mut back, VirtAddr(100)).unwrap();
        assert_eq!(back, data);
        space.destroy(&mut arena);
    }

    #[test]
    fn copy_out_keeps_bytes_written_before_the_failure() {
        let mut arena = PhysArena::new(8);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(PAGE_SIZE, &mut arena).unwrap();
        let err = copy_out(space.page_table(), VirtAddr(PAGE_SIZE - 2), b"abcd");
        assert_eq!(err, Err(VmError::BadAddress(VirtAddr(PAGE_SIZE))));
        let mut buf = [0u8; 2];
        copy_in(space.page_table(), &mut buf, VirtAddr(PAGE_SIZE - 2)).unwrap();
        assert_eq!(&buf, b"ab");
        space.destroy(&mut arena);
    }

    #[test]
    fn guard_page_is_not_user_accessible() {
        let mut arena = PhysArena::new(8);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(2 * PAGE_SIZE, &mut arena).unwrap();
        space.clear_user(VirtAddr(0));
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_in(space.page_table(), &mut buf, VirtAddr(8)),
            Err(VmError::BadAddress(VirtAddr(8)))
        );
        assert!(copy_in(space.page_table(), &mut buf, VirtAddr(PAGE_SIZE)).is_ok());
        space.destroy(&mut arena);
    }

    #[test]
    fn addresses_beyond_maxva_are_rejected() {
        let mut arena = PhysArena::new(4);
        let space = AddressSpace::new(&mut arena).unwrap();
        assert_eq!(
            copy_out(space.page_table(), VirtAddr(MAXVA), b"x"),
            Err(VmError::BadAddress(VirtAddr(MAXVA)))
        );
        let mut buf = [0u8; 1];
        assert!(copy_in(space.page_table(), &mut buf, VirtAddr(usize::MAX)).is_err());
        // 长度为 0 时什么都不碰
        assert!(copy_out(space.page_table(), VirtAddr(MAXVA), b"").is_ok());
        space.destroy(&mut arena);
    }

    #[test]
    fn string_with_terminator() {
        let mut arena = PhysArena::new(8);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(2 * PAGE_SIZE, &mut arena).unwrap();
        // 字符串跨过页边界
        let va = VirtAddr(PAGE_SIZE - 3);
        copy_out(space.page_table(), va, b"/bin/sh\0").unwrap();
        let mut buf = [0xffu8; 32];
        assert_eq!(copy_in_string(space.page_table(), &mut buf, va, 32), Ok(7));
        assert_eq!(&buf[..8], b"/bin/sh\0");
        space.destroy(&mut arena);
    }

    #[test]
    fn string_without_terminator_within_bound() {
        let mut arena = PhysArena::new(8);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(PAGE_SIZE, &mut arena).unwrap();
        copy_out(space.page_table(), VirtAddr(0), b"abcdef\0").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(
            copy_in_string(space.page_table(), &mut buf, VirtAddr(0), 6),
            Err(VmError::NoTerminator)
        );
        // 受 dst 长度限制
        let mut small = [0u8; 4];
        assert_eq!(
            copy_in_string(space.page_table(), &mut small, VirtAddr(0), 32),
            Err(VmError::NoTerminator)
        );
        assert_eq!(&small, b"abcd");
        assert_eq!(copy_in_string(space.page_table(), &mut buf, VirtAddr(6), 32), Ok(0));
        space.destroy(&mut arena);
    }

    #[test]
    fn string_running_into_unmapped_page() {
        let mut arena = PhysArena::new(8);
        let mut space = AddressSpace::new(&mut arena).unwrap();
        space.grow(PAGE_SIZE, &mut arena).unwrap();
        copy_out(space.page_table(), VirtAddr(PAGE_SIZE - 2), b"ab").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            copy_in_string(space.page_table(), &mut buf, VirtAddr(PAGE_SIZE - 2), 16),
            Err(VmError::BadAddress(VirtAddr(PAGE_SIZE)))
        );
        space.destroy(&mut arena);
    }
}
