use crate::debugger::dwarf::reader::SectionReader;
use smallvec::SmallVec;

const STACK_DEPTH: usize = 64;

/// Register values for `DW_OP_reg*`/`DW_OP_breg*`, keyed by DWARF register number.
pub trait RegisterProvider {
    fn register(&self, number: gimli::Register) -> Option<u64>;
}

/// Debuggee memory for `DW_OP_deref`. Reads are 8 bytes, little-endian.
pub trait MemoryProvider {
    fn read_word(&self, addr: u64) -> Option<u64>;
}

/// Where a location expression left the variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvalResult {
    /// The variable lives in memory at this address.
    Address(u64),
    /// The variable lives in this register.
    Register(gimli::Register),
    /// The expression computed the value itself (`DW_OP_stack_value`).
    Value(u64),
    /// The expression could not be resolved.
    Empty,
}

/// Stack machine over DWARF location expressions.
///
/// Providers are pluggable: without a memory provider `DW_OP_deref` returns
/// the address for external resolution, without a frame base `DW_OP_fbreg`
/// leaves the expression unresolved.
pub struct ExpressionEvaluator<'a> {
    registers: &'a dyn RegisterProvider,
    frame_base: Option<u64>,
    memory: Option<&'a dyn MemoryProvider>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(registers: &'a dyn RegisterProvider) -> Self {
        Self {
            registers,
            frame_base: None,
            memory: None,
        }
    }

    pub fn with_frame_base(self, frame_base: u64) -> Self {
        Self {
            frame_base: Some(frame_base),
            ..self
        }
    }

    pub fn with_memory(self, memory: &'a dyn MemoryProvider) -> Self {
        Self {
            memory: Some(memory),
            ..self
        }
    }

    pub fn evaluate(&self, expr: &[u8]) -> EvalResult {
        self.evaluate_inner(expr).unwrap_or(EvalResult::Empty)
    }

    fn evaluate_inner(&self, expr: &[u8]) -> Option<EvalResult> {
        let mut reader = SectionReader::new(expr);
        let mut stack: SmallVec<[u64; 8]> = SmallVec::new();
        let mut last_piece = None;

        const LIT0: u8 = gimli::DW_OP_lit0.0;
        const LIT31: u8 = gimli::DW_OP_lit31.0;
        const REG0: u8 = gimli::DW_OP_reg0.0;
        const REG31: u8 = gimli::DW_OP_reg31.0;
        const BREG0: u8 = gimli::DW_OP_breg0.0;
        const BREG31: u8 = gimli::DW_OP_breg31.0;

        while !reader.is_empty() {
            let opcode = gimli::DwOp(reader.read_u8().ok()?);
            match opcode {
                gimli::DW_OP_addr => {
                    push(&mut stack, reader.read_u64().ok()?)?;
                }
                gimli::DW_OP_deref => {
                    let addr = stack.pop()?;
                    match self.memory {
                        Some(memory) => push(&mut stack, memory.read_word(addr)?)?,
                        // Without a memory provider the address itself is the
                        // result and dereferencing is left to the caller.
                        None => return Some(EvalResult::Address(addr)),
                    }
                }
                gimli::DW_OP_const1u => push(&mut stack, reader.read_u8().ok()? as u64)?,
                gimli::DW_OP_const1s => push(&mut stack, reader.read_i8().ok()? as u64)?,
                gimli::DW_OP_const2u => push(&mut stack, reader.read_u16().ok()? as u64)?,
                gimli::DW_OP_const2s => {
                    push(&mut stack, reader.read_u16().ok()? as i16 as u64)?
                }
                gimli::DW_OP_const4u => push(&mut stack, reader.read_u32().ok()? as u64)?,
                gimli::DW_OP_const4s => {
                    push(&mut stack, reader.read_u32().ok()? as i32 as u64)?
                }
                gimli::DW_OP_const8u => push(&mut stack, reader.read_u64().ok()?)?,
                gimli::DW_OP_const8s => push(&mut stack, reader.read_u64().ok()?)?,
                gimli::DW_OP_constu => push(&mut stack, reader.read_uleb128().ok()?)?,
                gimli::DW_OP_consts => push(&mut stack, reader.read_sleb128().ok()? as u64)?,
                gimli::DW_OP_dup => {
                    let top = *stack.last()?;
                    push(&mut stack, top)?;
                }
                gimli::DW_OP_drop => {
                    stack.pop()?;
                }
                gimli::DW_OP_minus => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    push(&mut stack, lhs.wrapping_sub(rhs))?;
                }
                gimli::DW_OP_mul => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    push(&mut stack, lhs.wrapping_mul(rhs))?;
                }
                gimli::DW_OP_plus => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    push(&mut stack, lhs.wrapping_add(rhs))?;
                }
                gimli::DW_OP_plus_uconst => {
                    let addend = reader.read_uleb128().ok()?;
                    let top = stack.pop()?;
                    push(&mut stack, top.wrapping_add(addend))?;
                }
                gimli::DW_OP_regx => {
                    let number = reader.read_uleb128().ok()?;
                    return Some(EvalResult::Register(gimli::Register(number as u16)));
                }
                gimli::DW_OP_fbreg => {
                    let offset = reader.read_sleb128().ok()?;
                    let base = self.frame_base?;
                    push(&mut stack, base.wrapping_add(offset as u64))?;
                }
                gimli::DW_OP_bregx => {
                    let number = reader.read_uleb128().ok()?;
                    let offset = reader.read_sleb128().ok()?;
                    let value = self.registers.register(gimli::Register(number as u16))?;
                    push(&mut stack, value.wrapping_add(offset as u64))?;
                }
                gimli::DW_OP_piece => {
                    let _size_in_bytes = reader.read_uleb128().ok()?;
                    last_piece = stack.pop().or(last_piece);
                }
                gimli::DW_OP_stack_value => {
                    return Some(EvalResult::Value(stack.pop()?));
                }
                gimli::DwOp(op @ LIT0..=LIT31) => {
                    push(&mut stack, (op - LIT0) as u64)?;
                }
                gimli::DwOp(op @ REG0..=REG31) => {
                    return Some(EvalResult::Register(gimli::Register((op - REG0) as u16)));
                }
                gimli::DwOp(op @ BREG0..=BREG31) => {
                    let offset = reader.read_sleb128().ok()?;
                    let number = gimli::Register((op - BREG0) as u16);
                    let value = self.registers.register(number)?;
                    push(&mut stack, value.wrapping_add(offset as u64))?;
                }
                _ => return None,
            }
        }

        // A multi-piece value degrades to the address of its last piece.
        if let Some(piece) = last_piece {
            return Some(EvalResult::Address(piece));
        }
        stack.pop().map(EvalResult::Address)
    }
}

fn push(stack: &mut SmallVec<[u64; 8]>, value: u64) -> Option<()> {
    if stack.len() >= STACK_DEPTH {
        return None;
    }
    stack.push(value);
    Some(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::HashMap;

    pub struct TestRegisters(pub HashMap<u16, u64>);

    impl RegisterProvider for TestRegisters {
        fn register(&self, number: gimli::Register) -> Option<u64> {
            self.0.get(&number.0).copied()
        }
    }

    pub struct TestMemory(pub HashMap<u64, u64>);

    impl MemoryProvider for TestMemory {
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    fn no_registers() -> TestRegisters {
        TestRegisters(HashMap::new())
    }

    fn sleb(out: &mut Vec<u8>, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign_bit = byte & 0x40 != 0;
            let done = (value == 0 && !sign_bit) || (value == -1 && sign_bit);
            out.push(if done { byte } else { byte | 0x80 });
            if done {
                return;
            }
        }
    }

    #[test]
    fn test_stack_value_returns_top() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        // lit17 lit4 mul lit2 plus stack_value => 70
        let expr = [
            gimli::DW_OP_lit17.0,
            gimli::DW_OP_lit4.0,
            gimli::DW_OP_mul.0,
            gimli::DW_OP_lit2.0,
            gimli::DW_OP_plus.0,
            gimli::DW_OP_stack_value.0,
        ];
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Value(70));
    }

    #[test]
    fn test_fbreg_offsets_frame_base() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs).with_frame_base(0x1000);
        let mut expr = vec![gimli::DW_OP_fbreg.0];
        sleb(&mut expr, -8);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(0xff8));
    }

    #[test]
    fn test_fbreg_without_frame_base_is_unresolved() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_fbreg.0];
        sleb(&mut expr, -8);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Empty);
    }

    #[test]
    fn test_reg_op_names_the_register() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        assert_eq!(
            evaluator.evaluate(&[gimli::DW_OP_reg6.0]),
            EvalResult::Register(gimli::Register(6))
        );
        assert_eq!(
            evaluator.evaluate(&[gimli::DW_OP_regx.0, 33]),
            EvalResult::Register(gimli::Register(33))
        );
    }

    #[test]
    fn test_breg_adds_signed_offset() {
        let regs = TestRegisters(HashMap::from([(7, 0x7fff_0000u64)]));
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_breg7.0];
        sleb(&mut expr, 16);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(0x7fff_0010));
    }

    #[test]
    fn test_addr_push() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_addr.0];
        expr.extend(0xdead_beefu64.to_le_bytes());
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(0xdead_beef));
    }

    #[test]
    fn test_deref_with_memory_provider() {
        let regs = no_registers();
        let memory = TestMemory(HashMap::from([(0x2000u64, 42u64)]));
        let evaluator = ExpressionEvaluator::new(&regs).with_memory(&memory);
        let mut expr = vec![gimli::DW_OP_addr.0];
        expr.extend(0x2000u64.to_le_bytes());
        expr.push(gimli::DW_OP_deref.0);
        expr.push(gimli::DW_OP_stack_value.0);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Value(42));
    }

    #[test]
    fn test_deref_without_memory_returns_address() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_addr.0];
        expr.extend(0x2000u64.to_le_bytes());
        expr.push(gimli::DW_OP_deref.0);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(0x2000));
    }

    #[test]
    fn test_unknown_opcode_aborts() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let expr = [gimli::DW_OP_lit1.0, 0xe0];
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Empty);
    }

    #[test]
    fn test_stack_overflow_aborts() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let expr = vec![gimli::DW_OP_lit0.0; STACK_DEPTH + 1];
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Empty);
    }

    #[test]
    fn test_piece_takes_last_piece_address() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_addr.0];
        expr.extend(0x1000u64.to_le_bytes());
        expr.extend([gimli::DW_OP_piece.0, 4]);
        expr.push(gimli::DW_OP_addr.0);
        expr.extend(0x2000u64.to_le_bytes());
        expr.extend([gimli::DW_OP_piece.0, 4]);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(0x2000));
    }

    #[test]
    fn test_arithmetic_wraps() {
        let regs = no_registers();
        let evaluator = ExpressionEvaluator::new(&regs);
        let mut expr = vec![gimli::DW_OP_const8u.0];
        expr.extend(u64::MAX.to_le_bytes());
        expr.extend([gimli::DW_OP_plus_uconst.0, 2]);
        assert_eq!(evaluator.evaluate(&expr), EvalResult::Address(1));
    }
}
