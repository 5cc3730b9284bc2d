use crate::core::cpu::instruction::{AddressMode, Instruction, Opcode};
use crate::core::word::Word;

/// Renders one instruction word the way the debugger and traces show it.
/// `#` marks an immediate operand, `@` an indexed one.
pub fn disassemble(word: Word) -> String {
    let inst = Instruction(word);
    let opcode = inst.opcode();
    if opcode == Opcode::UNKNOWN {
        return format!("??? {:08}", word);
    }
    if !opcode.has_operand() {
        return opcode.mnemonic().to_string();
    }
    match inst.address_mode() {
        Some(AddressMode::Direct) => format!("{} {}", opcode.mnemonic(), inst.value()),
        Some(AddressMode::Immediate) => format!("{} #{}", opcode.mnemonic(), inst.value()),
        Some(AddressMode::Indexed) => format!("{} @{}", opcode.mnemonic(), inst.value()),
        None => format!("{} ?{}", opcode.mnemonic(), inst.value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_operand_forms() {
        assert_eq!(disassemble(4_100_005), "LOAD #5");
        assert_eq!(disassemble(5_000_042), "STR 42");
        assert_eq!(disassemble(200_010), "SUM @10");
    }

    #[test]
    fn renders_bare_mnemonics() {
        assert_eq!(disassemble(25_000_000), "PSH");
        assert_eq!(disassemble(13_000_000), "SVC");
    }

    #[test]
    fn renders_unknown_words() {
        assert_eq!(disassemble(99_123_456), "??? 99123456");
    }
}
