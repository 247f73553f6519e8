use std::fmt::{Display, Formatter};

/// Represent address in running program.
/// Relocated address is a `GlobalAddress` + ASLR slide of the text segment.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct RelocatedAddress(u64);

impl RelocatedAddress {
    #[inline(always)]
    pub fn into_global(self, slide: u64) -> GlobalAddress {
        GlobalAddress(self.0.wrapping_sub(slide))
    }

    #[inline(always)]
    pub fn offset(self, offset: i64) -> RelocatedAddress {
        if offset >= 0 {
            self.0.wrapping_add(offset as u64)
        } else {
            self.0.wrapping_sub(offset.unsigned_abs())
        }
        .into()
    }

    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr as u64)
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<RelocatedAddress> for usize {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as usize
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#016X}", self.0))
    }
}

/// Represent address in object files.
/// This address unique per object file but not per process.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct GlobalAddress(u64);

impl GlobalAddress {
    #[inline(always)]
    pub fn relocate(self, slide: u64) -> RelocatedAddress {
        RelocatedAddress(self.0.wrapping_add(slide))
    }

    pub fn in_range(self, low: u64, high: u64) -> bool {
        self.0 >= low && self.0 < high
    }

    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<usize> for GlobalAddress {
    fn from(addr: usize) -> Self {
        GlobalAddress(addr as u64)
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr)
    }
}

impl From<GlobalAddress> for usize {
    fn from(addr: GlobalAddress) -> Self {
        addr.0 as usize
    }
}

impl From<GlobalAddress> for u64 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#016X}", self.0))
    }
}
