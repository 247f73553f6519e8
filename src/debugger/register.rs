use crate::debugger::dwarf::eval::RegisterProvider;
use crate::debugger::error::Error;
use smallvec::{smallvec, SmallVec};
use std::str::FromStr;
use strum_macros::{Display, EnumString};

#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
}

#[cfg(target_arch = "x86_64")]
impl Register {
    /// Number of this register in the DWARF ABI
    /// (rax=0, rdx=1, rcx=2, rbx=3, rsi=4, rdi=5, rbp=6, rsp=7, r8..r15=8..15).
    pub fn dwarf_number(self) -> Option<gimli::Register> {
        let number = match self {
            Register::Rax => 0,
            Register::Rdx => 1,
            Register::Rcx => 2,
            Register::Rbx => 3,
            Register::Rsi => 4,
            Register::Rdi => 5,
            Register::Rbp => 6,
            Register::Rsp => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
            Register::R12 => 12,
            Register::R13 => 13,
            Register::R14 => 14,
            Register::R15 => 15,
            Register::Eflags => 49,
            Register::Rip => return None,
        };
        Some(gimli::Register(number))
    }
}

/// Snapshot of the general-purpose register file of the stopped thread.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegisterMap {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u64,
}

#[cfg(target_arch = "x86_64")]
impl RegisterMap {
    pub fn value(&self, register: Register) -> u64 {
        match register {
            Register::Rax => self.rax,
            Register::Rbx => self.rbx,
            Register::Rcx => self.rcx,
            Register::Rdx => self.rdx,
            Register::Rdi => self.rdi,
            Register::Rsi => self.rsi,
            Register::Rbp => self.rbp,
            Register::Rsp => self.rsp,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R10 => self.r10,
            Register::R11 => self.r11,
            Register::R12 => self.r12,
            Register::R13 => self.r13,
            Register::R14 => self.r14,
            Register::R15 => self.r15,
            Register::Rip => self.rip,
            Register::Eflags => self.eflags,
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        match register {
            Register::Rax => self.rax = value,
            Register::Rbx => self.rbx = value,
            Register::Rcx => self.rcx = value,
            Register::Rdx => self.rdx = value,
            Register::Rdi => self.rdi = value,
            Register::Rsi => self.rsi = value,
            Register::Rbp => self.rbp = value,
            Register::Rsp => self.rsp = value,
            Register::R8 => self.r8 = value,
            Register::R9 => self.r9 = value,
            Register::R10 => self.r10 = value,
            Register::R11 => self.r11 = value,
            Register::R12 => self.r12 = value,
            Register::R13 => self.r13 = value,
            Register::R14 => self.r14 = value,
            Register::R15 => self.r15 = value,
            Register::Rip => self.rip = value,
            Register::Eflags => self.eflags = value,
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, value: u64) {
        self.rip = value;
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.rsp
    }

    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.rbp
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl From<nix::libc::user_regs_struct> for RegisterMap {
    fn from(regs: nix::libc::user_regs_struct) -> Self {
        Self {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rdi: regs.rdi,
            rsi: regs.rsi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            eflags: regs.eflags,
        }
    }
}

/// Merge the snapshot back into the raw register block before `PTRACE_SETREGS`,
/// preserving fields the map does not track (segment registers, orig_rax).
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl RegisterMap {
    pub fn store(self, regs: &mut nix::libc::user_regs_struct) {
        regs.rax = self.rax;
        regs.rbx = self.rbx;
        regs.rcx = self.rcx;
        regs.rdx = self.rdx;
        regs.rdi = self.rdi;
        regs.rsi = self.rsi;
        regs.rbp = self.rbp;
        regs.rsp = self.rsp;
        regs.r8 = self.r8;
        regs.r9 = self.r9;
        regs.r10 = self.r10;
        regs.r11 = self.r11;
        regs.r12 = self.r12;
        regs.r13 = self.r13;
        regs.r14 = self.r14;
        regs.r15 = self.r15;
        regs.rip = self.rip;
        regs.eflags = self.eflags;
    }
}

#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    X0, X1, X2, X3, X4, X5, X6, X7,
    X8, X9, X10, X11, X12, X13, X14, X15,
    X16, X17, X18, X19, X20, X21, X22, X23,
    X24, X25, X26, X27, X28, X29, X30,
    Sp,
    Pc,
}

#[cfg(target_arch = "aarch64")]
impl Register {
    /// DWARF numbering for aarch64: x0..x30 = 0..30, sp = 31; the program
    /// counter is addressed as 32 here.
    pub fn dwarf_number(self) -> Option<gimli::Register> {
        Some(gimli::Register(self as u16))
    }
}

#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegisterMap {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[cfg(target_arch = "aarch64")]
impl RegisterMap {
    pub fn value(&self, register: Register) -> u64 {
        match register {
            Register::Sp => self.sp,
            Register::Pc => self.pc,
            reg => self.x[reg as usize],
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        match register {
            Register::Sp => self.sp = value,
            Register::Pc => self.pc = value,
            reg => self.x[reg as usize] = value,
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, value: u64) {
        self.pc = value;
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// x29 is the frame pointer in the AAPCS64 ABI.
    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.x[29]
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
impl From<nix::libc::user_regs_struct> for RegisterMap {
    fn from(regs: nix::libc::user_regs_struct) -> Self {
        Self {
            x: regs.regs,
            sp: regs.sp,
            pc: regs.pc,
            pstate: regs.pstate,
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
impl RegisterMap {
    pub fn store(self, regs: &mut nix::libc::user_regs_struct) {
        regs.regs = self.x;
        regs.sp = self.sp;
        regs.pc = self.pc;
        regs.pstate = self.pstate;
    }
}

/// Look up a register by its lowercase name (`"rip"`, `"x0"`, ...).
pub fn register_from_name(name: &str) -> Result<Register, Error> {
    Register::from_str(name).map_err(|_| Error::RegisterNameNotFound(name.to_string()))
}

/// Register file keyed by DWARF register numbers.
#[derive(Debug, Clone)]
pub struct DwarfRegisterMap(SmallVec<[Option<u64>; 0x80]>);

impl DwarfRegisterMap {
    pub fn value(&self, register: gimli::Register) -> Result<u64, Error> {
        self.0
            .get(register.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::RegisterNotFound(register))
    }

    pub fn update(&mut self, register: gimli::Register, value: u64) {
        let index = register.0 as usize;
        if index < self.0.len() {
            self.0[index] = Some(value);
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl From<RegisterMap> for DwarfRegisterMap {
    fn from(map: RegisterMap) -> Self {
        let mut dwarf_map: SmallVec<[Option<u64>; 0x80]> = smallvec![None; 0x80];
        dwarf_map[0] = Some(map.rax);
        dwarf_map[1] = Some(map.rdx);
        dwarf_map[2] = Some(map.rcx);
        dwarf_map[3] = Some(map.rbx);
        dwarf_map[4] = Some(map.rsi);
        dwarf_map[5] = Some(map.rdi);
        dwarf_map[6] = Some(map.rbp);
        dwarf_map[7] = Some(map.rsp);
        dwarf_map[8] = Some(map.r8);
        dwarf_map[9] = Some(map.r9);
        dwarf_map[10] = Some(map.r10);
        dwarf_map[11] = Some(map.r11);
        dwarf_map[12] = Some(map.r12);
        dwarf_map[13] = Some(map.r13);
        dwarf_map[14] = Some(map.r14);
        dwarf_map[15] = Some(map.r15);
        dwarf_map[49] = Some(map.eflags);
        DwarfRegisterMap(dwarf_map)
    }
}

#[cfg(target_arch = "aarch64")]
impl From<RegisterMap> for DwarfRegisterMap {
    fn from(map: RegisterMap) -> Self {
        let mut dwarf_map: SmallVec<[Option<u64>; 0x80]> = smallvec![None; 0x80];
        for (number, value) in map.x.iter().enumerate() {
            dwarf_map[number] = Some(*value);
        }
        dwarf_map[31] = Some(map.sp);
        dwarf_map[32] = Some(map.pc);
        DwarfRegisterMap(dwarf_map)
    }
}

impl RegisterProvider for DwarfRegisterMap {
    fn register(&self, number: gimli::Register) -> Option<u64> {
        self.value(number).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_register_names() {
        assert_eq!(register_from_name("rip").unwrap(), Register::Rip);
        assert_eq!(register_from_name("r13").unwrap(), Register::R13);
        assert!(register_from_name("xmm0").is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_dwarf_numbering() {
        // DWARF swaps rdx/rcx/rbx relative to the machine encoding.
        assert_eq!(Register::Rax.dwarf_number(), Some(gimli::Register(0)));
        assert_eq!(Register::Rdx.dwarf_number(), Some(gimli::Register(1)));
        assert_eq!(Register::Rbx.dwarf_number(), Some(gimli::Register(3)));
        assert_eq!(Register::Rbp.dwarf_number(), Some(gimli::Register(6)));

        let mut map = RegisterMap::default();
        map.update(Register::Rbp, 0x7fff_0000);
        map.update(Register::Rip, 0x401000);
        assert_eq!(map.pc(), 0x401000);
        assert_eq!(map.fp(), 0x7fff_0000);

        let dwarf_map = DwarfRegisterMap::from(map);
        assert_eq!(dwarf_map.value(gimli::Register(6)).unwrap(), 0x7fff_0000);
        assert!(dwarf_map.value(gimli::Register(90)).is_err());
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_dwarf_numbering() {
        let mut map = RegisterMap::default();
        map.update(Register::X29, 0x7fff_0000);
        map.update(Register::Pc, 0x401000);
        assert_eq!(map.fp(), 0x7fff_0000);

        let dwarf_map = DwarfRegisterMap::from(map);
        assert_eq!(dwarf_map.value(gimli::Register(29)).unwrap(), 0x7fff_0000);
        assert_eq!(dwarf_map.value(gimli::Register(32)).unwrap(), 0x401000);
    }
}
