//! Page arithmetic.

/// Page size assumed by the scatter-gather builder.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Offset of `addr` within its page.
#[inline]
pub const fn offset_in_page(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Number of pages touched by the byte range `[addr, addr + len)`.
///
/// Returns 0 for an empty range and `None` if the range wraps the address
/// space.
pub fn pages_spanned(addr: usize, len: usize) -> Option<usize> {
    let end = addr.checked_add(len)?.checked_add(PAGE_SIZE - 1)?;
    Some((end >> PAGE_SHIFT) - (addr >> PAGE_SHIFT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_spanned() {
        assert_eq!(pages_spanned(0, 0), Some(0));
        assert_eq!(pages_spanned(0, 1), Some(1));
        assert_eq!(pages_spanned(0, PAGE_SIZE), Some(1));
        assert_eq!(pages_spanned(0, PAGE_SIZE + 1), Some(2));
        assert_eq!(pages_spanned(PAGE_SIZE - 1, 2), Some(2));
        assert_eq!(pages_spanned(100, PAGE_SIZE), Some(2));
        assert_eq!(pages_spanned(usize::MAX - 10, 100), None);
    }

    #[test]
    fn test_offset_in_page() {
        assert_eq!(offset_in_page(0x1234), 0x234);
        assert_eq!(offset_in_page(PAGE_SIZE), 0);
    }
}
