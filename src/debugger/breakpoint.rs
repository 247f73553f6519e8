use crate::debugger::address::RelocatedAddress;
use crate::debugger::dwarf::line::LineTable;
use crate::debugger::error::Error;
use crate::debugger::process::TraceeMemory;
use std::cell::Cell;
use std::path::Path;

/// Trap instruction of the target architecture:
/// `INT3` on x86_64, `BRK #0` on aarch64.
#[cfg(target_arch = "x86_64")]
pub const TRAP_OPCODE: &[u8] = &[0xCC];
#[cfg(target_arch = "aarch64")]
pub const TRAP_OPCODE: &[u8] = &[0x00, 0x00, 0x20, 0xD4];

/// How far the reported pc sits past the breakpoint address after the trap
/// fires. `INT3` has already executed, `BRK` has not.
#[cfg(target_arch = "x86_64")]
pub const TRAP_PC_OFFSET: u64 = 1;
#[cfg(target_arch = "aarch64")]
pub const TRAP_PC_OFFSET: u64 = 0;

/// Condition hook supplied by a higher layer; the engine only consults the
/// verdict. Evaluation failures are reported, not swallowed.
pub type ConditionEvaluator = dyn Fn(&Breakpoint) -> anyhow::Result<bool>;

/// Source-level breakpoint. While enabled, the byte(s) at `addr` in the
/// debugee are the trap opcode and `saved` holds what was there.
pub struct Breakpoint {
    pub number: u32,
    pub addr: RelocatedAddress,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub condition: Option<String>,
    /// False when the request could not be bound to an address
    /// (no line info); no trap is written for such entries.
    pub verified: bool,
    saved: Cell<[u8; TRAP_OPCODE.len()]>,
    enabled: Cell<bool>,
    hit_count: Cell<u32>,
}

impl Breakpoint {
    fn new(number: u32, addr: RelocatedAddress) -> Self {
        Self {
            number,
            addr,
            file: None,
            line: None,
            condition: None,
            verified: true,
            saved: Cell::new([0; TRAP_OPCODE.len()]),
            enabled: Cell::new(false),
            hit_count: Cell::new(0),
        }
    }

    /// Unregistered trap used by the stepping logic; never listed and never
    /// numbered.
    pub(crate) fn temporary(addr: RelocatedAddress) -> Self {
        Self::new(0, addr)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count.get()
    }

    pub fn record_hit(&self) {
        self.hit_count.set(self.hit_count.get() + 1);
    }

    pub fn saved_bytes(&self) -> [u8; TRAP_OPCODE.len()] {
        self.saved.get()
    }

    /// Save the original instruction byte(s) and patch the trap opcode in.
    pub fn enable(&self, memory: &dyn TraceeMemory) -> Result<(), Error> {
        if !self.verified {
            return Ok(());
        }
        let original = memory.read_memory(self.addr, TRAP_OPCODE.len())?;
        let mut saved = [0u8; TRAP_OPCODE.len()];
        saved.copy_from_slice(&original);
        self.saved.set(saved);

        memory.write_memory(self.addr, TRAP_OPCODE)?;
        self.enabled.set(true);
        Ok(())
    }

    /// Symmetric restore of the saved byte(s).
    pub fn disable(&self, memory: &dyn TraceeMemory) -> Result<(), Error> {
        if !self.enabled.get() {
            return Ok(());
        }
        memory.write_memory(self.addr, &self.saved.get())?;
        self.enabled.set(false);
        Ok(())
    }

    /// Forget the process-side state; used when the debugee is replaced on
    /// restart and the trap must be re-armed against a fresh image.
    pub fn reset(&self) {
        self.enabled.set(false);
    }
}

/// Breakpoint list owner: resolution, id assignment, lookups.
pub struct BreakpointRegistry {
    breakpoints: Vec<Breakpoint>,
    next_number: u32,
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self {
            breakpoints: vec![],
            next_number: 1,
        }
    }

    /// Shift every bound address by a slide delta after a restart changed
    /// the runtime text base.
    pub fn relocate_all(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        for brkpt in &mut self.breakpoints {
            if brkpt.verified {
                brkpt.addr = RelocatedAddress::from(brkpt.addr.as_u64().wrapping_add(delta));
            }
        }
    }

    /// Bind `file:line` to a code address.
    ///
    /// Tie-breaks: an `is_stmt` row on the exact line wins; otherwise the
    /// `is_stmt` row with the smallest line not below the request (a
    /// breakpoint on a comment or blank line lands on the next statement).
    pub fn resolve_address(
        line_table: &LineTable,
        file: &str,
        line: u32,
    ) -> Result<(RelocatedAddress, u32), Error> {
        let matches_file = |index: u32| {
            line_table
                .file_path(index)
                .map(|path| Path::new(path).ends_with(file))
                .unwrap_or(false)
        };

        let candidates = || {
            line_table
                .entries()
                .iter()
                .filter(|entry| entry.is_stmt && !entry.end_sequence)
                .filter(|entry| matches_file(entry.file_index))
        };

        if let Some(exact) = candidates().find(|entry| entry.line == line) {
            return Ok((RelocatedAddress::from(exact.address), exact.line));
        }

        candidates()
            .filter(|entry| entry.line > line)
            .min_by_key(|entry| entry.line)
            .map(|next| (RelocatedAddress::from(next.address), next.line))
            .ok_or_else(|| Error::NoAddressForLine(file.to_string(), line as u64))
    }

    /// Register a breakpoint at an already resolved address.
    pub fn add(
        &mut self,
        addr: RelocatedAddress,
        file: Option<String>,
        line: Option<u32>,
        condition: Option<String>,
    ) -> &Breakpoint {
        let number = self.next_number;
        self.next_number += 1;

        let mut brkpt = Breakpoint::new(number, addr);
        brkpt.file = file;
        brkpt.line = line;
        brkpt.condition = condition;
        self.breakpoints.push(brkpt);
        self.breakpoints.last().expect("just pushed")
    }

    /// Register a request that could not be bound to an address.
    pub fn add_unverified(&mut self, file: String, line: u32) -> &Breakpoint {
        let number = self.next_number;
        self.next_number += 1;

        let mut brkpt = Breakpoint::new(number, RelocatedAddress::default());
        brkpt.file = Some(file);
        brkpt.line = Some(line);
        brkpt.verified = false;
        self.breakpoints.push(brkpt);
        self.breakpoints.last().expect("just pushed")
    }

    /// Drop the newest entry; rollback path for trap-write failures.
    pub fn remove_last(&mut self) {
        if self.breakpoints.pop().is_some() {
            self.next_number -= 1;
        }
    }

    pub fn remove(&mut self, number: u32) -> Result<Breakpoint, Error> {
        let index = self
            .breakpoints
            .iter()
            .position(|brkpt| brkpt.number == number)
            .ok_or(Error::BreakpointNotFound(number))?;
        Ok(self.breakpoints.remove(index))
    }

    pub fn find_by_address(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .find(|brkpt| brkpt.verified && brkpt.addr == addr)
    }

    pub fn find_by_number(&self, number: u32) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|brkpt| brkpt.number == number)
    }

    pub fn list(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Consult the (optional) condition hook for a hit breakpoint.
    pub fn should_stop(
        brkpt: &Breakpoint,
        evaluator: Option<&ConditionEvaluator>,
    ) -> Result<bool, Error> {
        match (&brkpt.condition, evaluator) {
            (None, _) => Ok(true),
            (Some(_), None) => {
                log::warn!(
                    target: "debugger",
                    "breakpoint {} has a condition but no evaluator is installed",
                    brkpt.number
                );
                Ok(true)
            }
            (Some(_), Some(evaluator)) => evaluator(brkpt).map_err(Error::Condition),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::debugger::dwarf::line::LineEntry;
    use std::cell::RefCell;

    /// Flat memory image for trap insertion tests.
    pub(crate) struct TestMemory {
        pub base: u64,
        pub image: RefCell<Vec<u8>>,
    }

    impl TestMemory {
        pub fn new(base: u64, image: Vec<u8>) -> Self {
            Self {
                base,
                image: RefCell::new(image),
            }
        }
    }

    impl TraceeMemory for TestMemory {
        fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
            let start = (addr.as_u64() - self.base) as usize;
            let image = self.image.borrow();
            image
                .get(start..start + len)
                .map(<[u8]>::to_vec)
                .ok_or(Error::MemoryRead(addr, len))
        }

        fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
            let start = (addr.as_u64() - self.base) as usize;
            let mut image = self.image.borrow_mut();
            let slice = image
                .get_mut(start..start + data.len())
                .ok_or(Error::MemoryWrite(addr, data.len()))?;
            slice.copy_from_slice(data);
            Ok(())
        }
    }

    fn row(address: u64, line: u32, is_stmt: bool) -> LineEntry {
        LineEntry {
            address,
            file_index: 0,
            line,
            column: 0,
            is_stmt,
            end_sequence: false,
        }
    }

    fn table() -> LineTable {
        LineTable::from_rows(
            vec![
                row(0x1000, 10, true),
                row(0x1008, 10, false),
                row(0x1010, 12, true),
                row(0x1020, 15, true),
                LineEntry {
                    address: 0x1030,
                    file_index: 0,
                    line: 15,
                    column: 0,
                    is_stmt: true,
                    end_sequence: true,
                },
            ],
            vec!["/proj/src/main.c".to_string()],
        )
    }

    #[test]
    fn test_exact_stmt_line_wins() {
        let (addr, line) = BreakpointRegistry::resolve_address(&table(), "main.c", 12).unwrap();
        assert_eq!(addr, RelocatedAddress::from(0x1010u64));
        assert_eq!(line, 12);
    }

    #[test]
    fn test_snap_to_next_statement() {
        // Line 13 has no row: the request lands on line 15.
        let (addr, line) = BreakpointRegistry::resolve_address(&table(), "main.c", 13).unwrap();
        assert_eq!(addr, RelocatedAddress::from(0x1020u64));
        assert_eq!(line, 15);
    }

    #[test]
    fn test_no_address_for_line() {
        assert!(matches!(
            BreakpointRegistry::resolve_address(&table(), "main.c", 100),
            Err(Error::NoAddressForLine(_, 100))
        ));
        assert!(matches!(
            BreakpointRegistry::resolve_address(&table(), "other.c", 12),
            Err(Error::NoAddressForLine(_, _))
        ));
    }

    #[test]
    fn test_file_matched_by_path_suffix() {
        assert!(BreakpointRegistry::resolve_address(&table(), "src/main.c", 12).is_ok());
        assert!(BreakpointRegistry::resolve_address(&table(), "/proj/src/main.c", 12).is_ok());
        // A suffix match respects path component boundaries.
        assert!(BreakpointRegistry::resolve_address(&table(), "ain.c", 12).is_err());
    }

    #[test]
    fn test_trap_insertion_and_restore() {
        let memory = TestMemory::new(0x1000, vec![0x55, 0x48, 0x89, 0xe5, 0x90]);
        let mut registry = BreakpointRegistry::new();
        let addr = RelocatedAddress::from(0x1001u64);
        registry.add(addr, None, None, None);

        let brkpt = registry.find_by_address(addr).unwrap();
        brkpt.enable(&memory).unwrap();
        assert!(brkpt.is_enabled());
        assert_eq!(
            memory.read_memory(addr, TRAP_OPCODE.len()).unwrap(),
            TRAP_OPCODE
        );

        brkpt.disable(&memory).unwrap();
        assert_eq!(
            memory.image.borrow()[..],
            [0x55, 0x48, 0x89, 0xe5, 0x90][..]
        );
        assert!(!brkpt.is_enabled());
    }

    #[test]
    fn test_numbers_assigned_from_one() {
        let mut registry = BreakpointRegistry::new();
        let first = registry.add(RelocatedAddress::from(0x1u64), None, None, None).number;
        let second = registry.add(RelocatedAddress::from(0x2u64), None, None, None).number;
        assert_eq!((first, second), (1, 2));

        registry.remove(1).unwrap();
        assert!(registry.find_by_number(1).is_none());
        assert!(registry.find_by_number(2).is_some());
        assert!(matches!(
            registry.remove(1),
            Err(Error::BreakpointNotFound(1))
        ));
    }

    #[test]
    fn test_condition_hook() {
        let mut registry = BreakpointRegistry::new();
        registry.add(
            RelocatedAddress::from(0x1u64),
            None,
            None,
            Some("x > 2".to_string()),
        );
        let brkpt = registry.find_by_number(1).unwrap();

        // No evaluator installed: conditions degrade to unconditional stops.
        assert!(BreakpointRegistry::should_stop(brkpt, None).unwrap());

        let always_false: Box<ConditionEvaluator> = Box::new(|_| Ok(false));
        assert!(!BreakpointRegistry::should_stop(brkpt, Some(&*always_false)).unwrap());

        let failing: Box<ConditionEvaluator> =
            Box::new(|_| anyhow::bail!("condition parse error"));
        assert!(matches!(
            BreakpointRegistry::should_stop(brkpt, Some(&*failing)),
            Err(Error::Condition(_))
        ));
    }
}
