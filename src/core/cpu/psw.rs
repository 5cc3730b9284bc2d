use crate::core::word::Word;

/// Condition code, the leftmost PSW digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    Equal = 0,
    Less = 1,
    Greater = 2,
    Overflow = 3,
}

impl CondCode {
    fn from_digit(digit: Word) -> CondCode {
        match digit {
            1 => CondCode::Less,
            2 => CondCode::Greater,
            3 => CondCode::Overflow,
            _ => CondCode::Equal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    User = 0,
    Kernel = 1,
}

/// Processor status word, packed as `CC·10^7 + MODE·10^6 + IE·10^5 + PC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Psw {
    pub cc: CondCode,
    pub mode: CpuMode,
    pub interrupts_enabled: bool,
    pub pc: Word,
}

impl Psw {
    pub fn pack(&self) -> Word {
        self.cc as Word * 10_000_000
            + self.mode as Word * 1_000_000
            + if self.interrupts_enabled { 100_000 } else { 0 }
            + self.pc.rem_euclid(100_000)
    }

    pub fn unpack(word: Word) -> Psw {
        Psw {
            cc: CondCode::from_digit(word / 10_000_000),
            mode: if (word / 1_000_000) % 10 == 0 {
                CpuMode::User
            } else {
                CpuMode::Kernel
            },
            interrupts_enabled: (word / 100_000) % 10 != 0,
            pc: word % 100_000,
        }
    }
}
