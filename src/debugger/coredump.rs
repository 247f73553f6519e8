use crate::debugger::address::RelocatedAddress;
use crate::debugger::binary::LoadError;
use crate::debugger::error::Error;
use crate::debugger::process::TraceeMemory;
use crate::debugger::register::RegisterMap;
use bytes::Bytes;
use std::fs;
use std::path::Path;

const ET_CORE: u16 = 4;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_PRSTATUS: u32 = 1;
/// `pr_reg` offset inside prstatus on 64-bit Linux.
const PRSTATUS_REGS_OFFSET: usize = 112;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CORE: u32 = 0x4;
const LC_SEGMENT_64: u32 = 0x19;
const LC_THREAD: u32 = 0x4;
const LC_UNIXTHREAD: u32 = 0x5;

#[cfg(target_arch = "x86_64")]
const X86_THREAD_STATE64: u32 = 4;
#[cfg(target_arch = "aarch64")]
const ARM_THREAD_STATE64: u32 = 6;

#[derive(Debug)]
struct Segment {
    vaddr: u64,
    data: Bytes,
}

/// Post-mortem image: the same memory and register surface as a live
/// process, fed from `PT_LOAD`/`LC_SEGMENT_64` segments and the first
/// thread-state note of the dump.
pub struct CoreDump {
    segments: Vec<Segment>,
    registers: Option<RegisterMap>,
}

impl CoreDump {
    pub fn load(path: &Path) -> Result<CoreDump, Error> {
        let data = fs::read(path)?;
        Self::from_bytes(Bytes::from(data))
    }

    pub fn from_bytes(data: Bytes) -> Result<CoreDump, Error> {
        if data.len() < 4 {
            return Err(LoadError::TooSmall.into());
        }
        if data[..4] == [0x7f, b'E', b'L', b'F'] {
            return parse_elf_core(&data);
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic == MH_MAGIC_64 {
            return parse_macho_core(&data);
        }
        Err(LoadError::InvalidMagic(magic).into())
    }

    /// Registers of the dumped thread, when the dump carried a recognized
    /// thread-state note.
    pub fn registers(&self) -> Option<RegisterMap> {
        self.registers
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl TraceeMemory for CoreDump {
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let start = addr.as_u64();
        let segment = self
            .segments
            .iter()
            .find(|segment| {
                start >= segment.vaddr && start + len as u64 <= segment.vaddr + segment.data.len() as u64
            })
            .ok_or(Error::AddressNotMapped(addr))?;

        let offset = (start - segment.vaddr) as usize;
        Ok(segment.data[offset..offset + len].to_vec())
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        // A dump is immutable.
        Err(Error::MemoryWrite(addr, data.len()))
    }
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

fn parse_elf_core(data: &Bytes) -> Result<CoreDump, Error> {
    if data.len() < 64 {
        return Err(LoadError::TooSmall.into());
    }
    let e_type = u16_at(data, 16).unwrap_or(0);
    if e_type != ET_CORE {
        return Err(LoadError::UnsupportedFormat("elf file is not a core dump").into());
    }

    let phoff = u64_at(data, 32).ok_or(LoadError::TooSmall)? as usize;
    let phentsize = u16_at(data, 54).ok_or(LoadError::TooSmall)? as usize;
    let phnum = u16_at(data, 56).ok_or(LoadError::TooSmall)? as usize;
    let phentsize = if phentsize == 0 { 56 } else { phentsize };

    let mut segments = vec![];
    let mut registers = None;

    for index in 0..phnum {
        let header = phoff + index * phentsize;
        let p_type = u32_at(data, header).ok_or(LoadError::IncompleteRead)?;
        let p_offset = u64_at(data, header + 8).ok_or(LoadError::IncompleteRead)? as usize;
        let p_vaddr = u64_at(data, header + 16).ok_or(LoadError::IncompleteRead)?;
        let p_filesz = u64_at(data, header + 32).ok_or(LoadError::IncompleteRead)? as usize;

        let end = p_offset
            .checked_add(p_filesz)
            .ok_or(LoadError::IncompleteRead)?;
        if end > data.len() {
            return Err(LoadError::IncompleteRead.into());
        }

        match p_type {
            PT_LOAD if p_filesz > 0 => segments.push(Segment {
                vaddr: p_vaddr,
                data: data.slice(p_offset..end),
            }),
            PT_NOTE if registers.is_none() => {
                registers = prstatus_registers(&data[p_offset..end]);
            }
            _ => {}
        }
    }

    Ok(CoreDump {
        segments,
        registers,
    })
}

/// Walk the note records of a `PT_NOTE` segment and decode the first
/// `NT_PRSTATUS` register block.
fn prstatus_registers(notes: &[u8]) -> Option<RegisterMap> {
    let align4 = |value: usize| (value + 3) & !3;

    let mut offset = 0;
    while offset + 12 <= notes.len() {
        let namesz = u32_at(notes, offset)? as usize;
        let descsz = u32_at(notes, offset + 4)? as usize;
        let note_type = u32_at(notes, offset + 8)?;
        let desc_offset = offset + 12 + align4(namesz);
        let desc = notes.get(desc_offset..desc_offset + descsz)?;

        if note_type == NT_PRSTATUS {
            return prstatus_to_registers(desc);
        }
        offset = desc_offset + align4(descsz);
    }
    None
}

/// The x86_64 `pr_reg` block follows the kernel's `user_regs_struct` order.
#[cfg(target_arch = "x86_64")]
fn prstatus_to_registers(desc: &[u8]) -> Option<RegisterMap> {
    let reg = |index: usize| u64_at(desc, PRSTATUS_REGS_OFFSET + index * 8);

    Some(RegisterMap {
        r15: reg(0)?,
        r14: reg(1)?,
        r13: reg(2)?,
        r12: reg(3)?,
        rbp: reg(4)?,
        rbx: reg(5)?,
        r11: reg(6)?,
        r10: reg(7)?,
        r9: reg(8)?,
        r8: reg(9)?,
        rax: reg(10)?,
        rcx: reg(11)?,
        rdx: reg(12)?,
        rsi: reg(13)?,
        rdi: reg(14)?,
        // index 15 is orig_rax
        rip: reg(16)?,
        // index 17 is cs
        eflags: reg(18)?,
        rsp: reg(19)?,
    })
}

/// The aarch64 `pr_reg` block is x0..x30, sp, pc, pstate.
#[cfg(target_arch = "aarch64")]
fn prstatus_to_registers(desc: &[u8]) -> Option<RegisterMap> {
    let reg = |index: usize| u64_at(desc, PRSTATUS_REGS_OFFSET + index * 8);

    let mut x = [0u64; 31];
    for (index, slot) in x.iter_mut().enumerate() {
        *slot = reg(index)?;
    }
    Some(RegisterMap {
        x,
        sp: reg(31)?,
        pc: reg(32)?,
        pstate: reg(33)?,
    })
}

fn parse_macho_core(data: &Bytes) -> Result<CoreDump, Error> {
    if data.len() < 32 {
        return Err(LoadError::TooSmall.into());
    }
    let filetype = u32_at(data, 12).ok_or(LoadError::TooSmall)?;
    if filetype != MH_CORE {
        return Err(LoadError::UnsupportedFormat("mach-o file is not a core dump").into());
    }
    let ncmds = u32_at(data, 16).ok_or(LoadError::TooSmall)? as usize;

    let mut segments = vec![];
    let mut registers = None;

    let mut cmd_offset = 32usize;
    for _ in 0..ncmds {
        let cmd = u32_at(data, cmd_offset).ok_or(LoadError::IncompleteRead)?;
        let cmdsize = u32_at(data, cmd_offset + 4).ok_or(LoadError::IncompleteRead)? as usize;
        if cmdsize < 8 || cmd_offset + cmdsize > data.len() {
            return Err(LoadError::IncompleteRead.into());
        }

        match cmd {
            LC_SEGMENT_64 => {
                let vmaddr = u64_at(data, cmd_offset + 24).ok_or(LoadError::IncompleteRead)?;
                let fileoff =
                    u64_at(data, cmd_offset + 40).ok_or(LoadError::IncompleteRead)? as usize;
                let filesize =
                    u64_at(data, cmd_offset + 48).ok_or(LoadError::IncompleteRead)? as usize;
                let end = fileoff
                    .checked_add(filesize)
                    .ok_or(LoadError::IncompleteRead)?;
                if end > data.len() {
                    return Err(LoadError::IncompleteRead.into());
                }
                if filesize > 0 {
                    segments.push(Segment {
                        vaddr: vmaddr,
                        data: data.slice(fileoff..end),
                    });
                }
            }
            LC_THREAD | LC_UNIXTHREAD if registers.is_none() => {
                let flavor = u32_at(data, cmd_offset + 8).ok_or(LoadError::IncompleteRead)?;
                let count = u32_at(data, cmd_offset + 12).ok_or(LoadError::IncompleteRead)?;
                let state = &data[cmd_offset + 16..cmd_offset + cmdsize];
                if state.len() >= count as usize * 4 {
                    registers = thread_state_registers(flavor, state);
                }
            }
            _ => {}
        }

        cmd_offset += cmdsize;
    }

    Ok(CoreDump {
        segments,
        registers,
    })
}

/// `LC_THREAD` x86 flavor: rax,rbx,rcx,rdx,rdi,rsi,rbp,rsp,r8..r15,rip,rflags.
#[cfg(target_arch = "x86_64")]
fn thread_state_registers(flavor: u32, state: &[u8]) -> Option<RegisterMap> {
    if flavor != X86_THREAD_STATE64 {
        return None;
    }
    let reg = |index: usize| u64_at(state, index * 8);

    Some(RegisterMap {
        rax: reg(0)?,
        rbx: reg(1)?,
        rcx: reg(2)?,
        rdx: reg(3)?,
        rdi: reg(4)?,
        rsi: reg(5)?,
        rbp: reg(6)?,
        rsp: reg(7)?,
        r8: reg(8)?,
        r9: reg(9)?,
        r10: reg(10)?,
        r11: reg(11)?,
        r12: reg(12)?,
        r13: reg(13)?,
        r14: reg(14)?,
        r15: reg(15)?,
        rip: reg(16)?,
        eflags: reg(17)?,
    })
}

/// `LC_THREAD` arm flavor: x0..x28, fp, lr, sp, pc, cpsr.
#[cfg(target_arch = "aarch64")]
fn thread_state_registers(flavor: u32, state: &[u8]) -> Option<RegisterMap> {
    if flavor != ARM_THREAD_STATE64 {
        return None;
    }
    let reg = |index: usize| u64_at(state, index * 8);

    let mut x = [0u64; 31];
    for (index, slot) in x.iter_mut().enumerate().take(29) {
        *slot = reg(index)?;
    }
    x[29] = reg(29)?; // fp
    x[30] = reg(30)?; // lr
    Some(RegisterMap {
        x,
        sp: reg(31)?,
        pc: reg(32)?,
        pstate: u32_at(state, 33 * 8)? as u64,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::register::Register;

    /// ELF core with one loadable segment at `vaddr` and an optional
    /// prstatus note.
    fn build_elf_core(vaddr: u64, payload: &[u8], prstatus: Option<&[u8]>) -> Vec<u8> {
        let phnum = 1 + prstatus.is_some() as usize;
        let phoff = 64;
        let data_offset = phoff + phnum * 56;

        let mut image = vec![0u8; 64];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2;
        image[5] = 1;
        image[16..18].copy_from_slice(&ET_CORE.to_le_bytes());
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[54..56].copy_from_slice(&56u16.to_le_bytes());
        image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut phdr = [0u8; 56];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        phdr[8..16].copy_from_slice(&(data_offset as u64).to_le_bytes());
        phdr[16..24].copy_from_slice(&vaddr.to_le_bytes());
        phdr[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        image.extend(phdr);

        if let Some(note_desc) = prstatus {
            let mut note = vec![];
            note.extend(5u32.to_le_bytes()); // namesz ("CORE\0")
            note.extend((note_desc.len() as u32).to_le_bytes());
            note.extend(NT_PRSTATUS.to_le_bytes());
            note.extend(b"CORE\0\0\0\0");
            note.extend(note_desc);

            let note_offset = data_offset + payload.len();
            let mut phdr = [0u8; 56];
            phdr[0..4].copy_from_slice(&PT_NOTE.to_le_bytes());
            phdr[8..16].copy_from_slice(&(note_offset as u64).to_le_bytes());
            phdr[32..40].copy_from_slice(&(note.len() as u64).to_le_bytes());
            image.extend(phdr);
            image.extend(payload);
            image.extend(note);
        } else {
            image.extend(payload);
        }

        image
    }

    #[test]
    fn test_segment_read() {
        let mut payload = vec![0xde, 0xad, 0xbe, 0xef];
        payload.extend([0u8; 124]);
        let image = build_elf_core(0x1000, &payload, None);

        let core = CoreDump::from_bytes(Bytes::from(image)).unwrap();
        assert_eq!(core.segment_count(), 1);
        assert_eq!(
            core.read_memory(RelocatedAddress::from(0x1000u64), 4).unwrap(),
            [0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(
            core.read_memory(RelocatedAddress::from(0x1010u64), 8).unwrap(),
            [0u8; 8]
        );
    }

    #[test]
    fn test_unmapped_address() {
        let image = build_elf_core(0x1000, &[0u8; 16], None);
        let core = CoreDump::from_bytes(Bytes::from(image)).unwrap();
        assert!(matches!(
            core.read_memory(RelocatedAddress::from(0x4000u64), 4),
            Err(Error::AddressNotMapped(_))
        ));
        // Reads crossing the end of a segment are unmapped too.
        assert!(matches!(
            core.read_memory(RelocatedAddress::from(0x100cu64), 8),
            Err(Error::AddressNotMapped(_))
        ));
    }

    #[test]
    fn test_write_is_rejected() {
        let image = build_elf_core(0x1000, &[0u8; 16], None);
        let core = CoreDump::from_bytes(Bytes::from(image)).unwrap();
        assert!(core
            .write_memory(RelocatedAddress::from(0x1000u64), &[1])
            .is_err());
    }

    #[test]
    fn test_non_core_elf_is_rejected() {
        let mut image = build_elf_core(0x1000, &[0u8; 16], None);
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        assert!(CoreDump::from_bytes(Bytes::from(image)).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_prstatus_registers() {
        let mut desc = vec![0u8; PRSTATUS_REGS_OFFSET + 27 * 8];
        let write_reg = |desc: &mut Vec<u8>, index: usize, value: u64| {
            let offset = PRSTATUS_REGS_OFFSET + index * 8;
            desc[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        };
        write_reg(&mut desc, 16, 0x40_1000); // rip
        write_reg(&mut desc, 19, 0x7fff_0000); // rsp
        write_reg(&mut desc, 4, 0x7fff_0040); // rbp

        let image = build_elf_core(0x1000, &[0u8; 16], Some(&desc));
        let core = CoreDump::from_bytes(Bytes::from(image)).unwrap();

        let registers = core.registers().unwrap();
        assert_eq!(registers.pc(), 0x40_1000);
        assert_eq!(registers.value(Register::Rsp), 0x7fff_0000);
        assert_eq!(registers.fp(), 0x7fff_0040);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_macho_core() {
        let seg_cmdsize = 72u32;
        let thread_cmdsize: usize = 16 + 21 * 8;
        let data_offset = 32 + seg_cmdsize as usize + thread_cmdsize;

        let mut image = vec![0u8; 32];
        image[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        image[12..16].copy_from_slice(&MH_CORE.to_le_bytes());
        image[16..20].copy_from_slice(&2u32.to_le_bytes()); // ncmds

        image.extend(LC_SEGMENT_64.to_le_bytes());
        image.extend(seg_cmdsize.to_le_bytes());
        image.extend([0u8; 16]); // segname
        image.extend(0x5000u64.to_le_bytes()); // vmaddr
        image.extend(0u64.to_le_bytes()); // vmsize
        image.extend((data_offset as u64).to_le_bytes()); // fileoff
        image.extend(4u64.to_le_bytes()); // filesize
        image.extend([0u8; 16]); // prots, nsects, flags

        image.extend(LC_THREAD.to_le_bytes());
        image.extend((thread_cmdsize as u32).to_le_bytes());
        image.extend(X86_THREAD_STATE64.to_le_bytes());
        image.extend(42u32.to_le_bytes()); // state count in u32 units
        let mut state = vec![0u64; 21];
        state[16] = 0x1_0000_2000; // rip
        for value in &state {
            image.extend(value.to_le_bytes());
        }

        image.extend([0xca, 0xfe, 0xba, 0xbe]);

        let core = CoreDump::from_bytes(Bytes::from(image)).unwrap();
        assert_eq!(
            core.read_memory(RelocatedAddress::from(0x5000u64), 4).unwrap(),
            [0xca, 0xfe, 0xba, 0xbe]
        );
        assert_eq!(core.registers().unwrap().pc(), 0x1_0000_2000);
    }
}
