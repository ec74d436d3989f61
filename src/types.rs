use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Kernel thread identifier. On the ptrace host this is the task id under
/// `/proc/<pid>/task`; on the mach host it is the thread port name.
pub type Tid = i32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<i64> for VirtAddr {
    type Output = Self;

    fn add(self, offset: i64) -> Self {
        VirtAddr((self.0 as i64).wrapping_add(offset) as u64)
    }
}

impl Sub<i64> for VirtAddr {
    type Output = Self;

    fn sub(self, offset: i64) -> Self {
        VirtAddr((self.0 as i64).wrapping_sub(offset) as u64)
    }
}

impl AddAssign<i64> for VirtAddr {
    fn add_assign(&mut self, offset: i64) {
        self.0 = (self.0 as i64).wrapping_add(offset) as u64;
    }
}

impl SubAssign<i64> for VirtAddr {
    fn sub_assign(&mut self, offset: i64) {
        self.0 = (self.0 as i64).wrapping_sub(offset) as u64;
    }
}
