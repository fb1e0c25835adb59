//! 物理地址包装

use bit_field::BitField;

use core::convert::TryFrom;
use core::fmt;

use crate::consts::PGSHIFT;

/// 地址类型通用接口
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = super::pg_round_up(*self.data_ref())
    }

    /// 向下取整到页边界
    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = super::pg_round_down(*self.data_ref())
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        *self.data_ref() as *const u8
    }

    /// 转换为可变裸指针
    ///
    /// # 安全性
    /// 只有分配器交给调用者的页才可以经由该指针写入
    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 页对齐的物理地址
///
/// 由 [`TryFrom<usize>`] 构造的值保证页对齐；
/// 是否落在某个分配器管理的区间内由分配器自己检查。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// 从原始值构造物理地址，不做任何检查
    ///
    /// # 安全性
    /// 调用者必须确保 `raw` 页对齐，分配器会对未对齐的地址触发 panic
    #[inline]
    pub const unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> usize {
        self.0
    }

    /// 地址的页内偏移，对合法的 `PhysAddr` 恒为 0
    #[inline]
    pub fn page_offset(&self) -> usize {
        self.0.get_bits(0..PGSHIFT)
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    /// 地址必须页对齐
    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr.get_bits(0..PGSHIFT) != 0 {
            return Err("PhysAddr addr not aligned");
        }
        Ok(PhysAddr(addr))
    }
}

impl From<PhysAddr> for usize {
    fn from(pa: PhysAddr) -> usize {
        pa.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PGSIZE;

    #[test]
    fn only_aligned_addresses_convert() {
        assert!(PhysAddr::try_from(0x8000_0000).is_ok());
        assert!(PhysAddr::try_from(0x8000_0000 + PGSIZE).is_ok());
        assert_eq!(
            PhysAddr::try_from(0x8000_0001),
            Err("PhysAddr addr not aligned")
        );
    }

    #[test]
    fn rounding_stays_on_page_boundaries() {
        let mut a = unsafe { PhysAddr::from_raw(PGSIZE + 1) };
        assert_eq!(a.page_offset(), 1);
        assert!(!a.is_aligned());
        a.pg_round_up();
        assert_eq!(a.as_usize(), 2 * PGSIZE);

        let mut b = unsafe { PhysAddr::from_raw(2 * PGSIZE - 1) };
        b.pg_round_down();
        assert_eq!(b.into_raw(), PGSIZE);
    }
}
