use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::cpu::instruction::{AddressMode, Instruction, Opcode};
use crate::core::cpu::psw::{CondCode, CpuMode, Psw};
use crate::core::dma::DmaController;
use crate::core::interrupt::{InterruptController, InterruptKind};
use crate::core::memory::Memory;
use crate::core::word::{Word, ALU_MAX};
use crate::core::{MEM_OS, MEM_WORDS};

pub mod instruction;
pub mod disassembler;
pub mod psw;

enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl AluOp {
    fn mnemonic(&self) -> &'static str {
        match self {
            AluOp::Add => "SUM",
            AluOp::Sub => "RES",
            AluOp::Mul => "MULT",
            AluOp::Div => "DIVI",
        }
    }
}

enum JumpCond {
    Always,
    Equal,
    NotEqual,
    Less,
    Greater,
}

/// Register snapshot handed to the debugger and console.
#[derive(Debug, Clone)]
pub struct CpuRegisters {
    pub ac: Word,
    pub mar: Word,
    pub mdr: Word,
    pub ir: Word,
    pub rb: Word,
    pub rl: Word,
    pub rx: Word,
    pub sp: Word,
    pub psw: Psw,
}

impl CpuRegisters {
    pub fn dump(&self) -> String {
        let mut dump = String::new();
        dump.push_str(&format!("AC  : {:08}\n", self.ac));
        dump.push_str(&format!("MAR : {:08}\n", self.mar));
        dump.push_str(&format!("MDR : {:08}\n", self.mdr));
        dump.push_str(&format!("IR  : {:08}\n", self.ir));
        dump.push_str(&format!("RB  : {:08}\n", self.rb));
        dump.push_str(&format!("RL  : {:08}\n", self.rl));
        dump.push_str(&format!("RX  : {:08}\n", self.rx));
        dump.push_str(&format!("SP  : {:08}\n", self.sp));
        dump.push_str(&format!("PC  : {:05}\n", self.psw.pc));
        dump.push_str(&format!(
            "Modo: {} | CC: {:?} | INT: {}\n",
            match self.psw.mode {
                CpuMode::Kernel => "KERNEL",
                CpuMode::User => "USUARIO",
            },
            self.psw.cc,
            if self.psw.interrupts_enabled { "ON" } else { "OFF" }
        ));
        dump
    }
}

pub struct Cpu {
    ac: Word,
    rx: Word,
    sp: Word,
    rb: Word,
    rl: Word,
    mar: Word,
    mdr: Word,
    ir: Word,
    psw: Psw,
    interrupts: Arc<InterruptController>,
}

impl Cpu {
    pub fn new(interrupts: Arc<InterruptController>) -> Self {
        Cpu {
            ac: 0,
            rx: 0,
            sp: 0,
            rb: MEM_OS as Word,
            rl: MEM_WORDS as Word - 1,
            mar: 0,
            mdr: 0,
            ir: 0,
            psw: Psw {
                cc: CondCode::Equal,
                mode: CpuMode::Kernel,
                interrupts_enabled: true,
                pc: MEM_OS as Word,
            },
            interrupts,
        }
    }

    pub fn pc(&self) -> Word {
        self.psw.pc
    }

    pub fn set_pc(&mut self, pc: Word) {
        self.psw.pc = pc;
    }

    pub fn ac(&self) -> Word {
        self.ac
    }

    pub fn set_ac(&mut self, ac: Word) {
        self.ac = ac;
    }

    pub fn sp(&self) -> Word {
        self.sp
    }

    pub fn set_sp(&mut self, sp: Word) {
        self.sp = sp;
    }

    pub fn set_rx(&mut self, rx: Word) {
        self.rx = rx;
    }

    pub fn set_rb(&mut self, rb: Word) {
        self.rb = rb;
    }

    pub fn set_rl(&mut self, rl: Word) {
        self.rl = rl;
    }

    pub fn mode(&self) -> CpuMode {
        self.psw.mode
    }

    pub fn set_mode(&mut self, mode: CpuMode) {
        self.psw.mode = mode;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.psw.interrupts_enabled
    }

    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.psw.interrupts_enabled = enabled;
    }

    pub fn registers(&self) -> CpuRegisters {
        CpuRegisters {
            ac: self.ac,
            mar: self.mar,
            mdr: self.mdr,
            ir: self.ir,
            rb: self.rb,
            rl: self.rl,
            rx: self.rx,
            sp: self.sp,
            psw: self.psw,
        }
    }

    /// One fetch-decode-execute cycle. The caller holds the bus for its whole
    /// duration.
    pub fn step(&mut self, memory: &mut Memory, dma: &mut DmaController, clock: &mut Clock) {
        if !self.fetch(memory) {
            return;
        }
        let inst = Instruction(self.ir);
        self.execute(&inst, memory, dma, clock);
    }

    fn fetch(&mut self, memory: &Memory) -> bool {
        if self.psw.mode == CpuMode::User {
            let pc = self.psw.pc;
            // the stack region above RX is not executable
            if !self.check_bounds(pc) || (self.rx > self.rb && pc >= self.rx) {
                warn!("Fetch outside user region: PC={}", pc);
                self.interrupts.raise(InterruptKind::BadAddress);
                return false;
            }
        }
        self.mar = self.psw.pc;
        self.mdr = memory.read(self.mar);
        self.ir = self.mdr;
        self.psw.pc += 1;
        debug!(
            "FETCH: MAR={} MDR={:08} IR={:08} PC={}",
            self.mar, self.mdr, self.ir, self.psw.pc
        );
        true
    }

    fn execute(&mut self, inst: &Instruction, memory: &mut Memory, dma: &mut DmaController, clock: &mut Clock) {
        let opcode = inst.opcode();
        debug!("EXECUTE: {}", disassembler::disassemble(self.ir));

        if opcode.is_privileged() && self.psw.mode == CpuMode::User {
            warn!("Privileged instruction {} in user mode", opcode.mnemonic());
            self.interrupts.raise(InterruptKind::BadInstruction);
            return;
        }

        match opcode {
            Opcode::SUM => self.op_alu(inst, memory, AluOp::Add),
            Opcode::RES => self.op_alu(inst, memory, AluOp::Sub),
            Opcode::MULT => self.op_alu(inst, memory, AluOp::Mul),
            Opcode::DIVI => self.op_alu(inst, memory, AluOp::Div),
            Opcode::LOAD => {
                if let Some(operand) = self.operand(inst, memory) {
                    self.ac = operand;
                    debug!("LOAD: AC={:08}", self.ac);
                }
            }
            Opcode::STR => self.op_store(inst, memory),
            Opcode::LOADRX => self.ac = self.rx,
            Opcode::STRRX => self.op_store_rx(),
            Opcode::COMP => {
                if let Some(operand) = self.operand(inst, memory) {
                    let result = self.ac as i64 - operand as i64;
                    self.update_cc(result);
                    debug!("COMP: AC={} operand={} cc={:?}", self.ac, operand, self.psw.cc);
                }
            }
            Opcode::JMPE => self.op_jump(inst, memory, JumpCond::Equal),
            Opcode::JMPNE => self.op_jump(inst, memory, JumpCond::NotEqual),
            Opcode::JMPLT => self.op_jump(inst, memory, JumpCond::Less),
            Opcode::JMPGT => self.op_jump(inst, memory, JumpCond::Greater),
            Opcode::J => self.op_jump(inst, memory, JumpCond::Always),
            Opcode::SVC => self.interrupts.raise(InterruptKind::Syscall),
            Opcode::RETRN => self.op_return(memory),
            Opcode::HAB => {
                self.psw.interrupts_enabled = true;
                info!("Interrupts enabled");
            }
            Opcode::DHAB => {
                self.psw.interrupts_enabled = false;
                info!("Interrupts disabled");
            }
            Opcode::TTI => clock.set_period(inst.value() as u64),
            Opcode::CHMOD => self.op_chmod(inst),
            Opcode::LOADRB => self.ac = self.rb,
            Opcode::STRRB => self.rb = self.ac,
            Opcode::LOADRL => self.ac = self.rl,
            Opcode::STRRL => self.rl = self.ac,
            Opcode::LOADSP => self.ac = self.sp,
            Opcode::STRSP => self.op_store_sp(),
            Opcode::PSH => self.op_push(memory),
            Opcode::POP => self.op_pop(memory),
            Opcode::SDMAP => {
                if let Some(operand) = self.operand(inst, memory) {
                    dma.set_track(operand);
                }
            }
            Opcode::SDMAC => {
                if let Some(operand) = self.operand(inst, memory) {
                    dma.set_cylinder(operand);
                }
            }
            Opcode::SDMAS => {
                if let Some(operand) = self.operand(inst, memory) {
                    dma.set_sector(operand);
                }
            }
            Opcode::SDMAIO => {
                if let Some(operand) = self.operand(inst, memory) {
                    dma.set_operation(operand);
                }
            }
            Opcode::SDMAM => {
                if let Some(operand) = self.operand(inst, memory) {
                    dma.set_address(operand);
                }
            }
            Opcode::SDMAON => dma.start(),
            Opcode::UNKNOWN => {
                warn!("Invalid opcode {}", inst.opcode_digits());
                self.interrupts.raise(InterruptKind::BadInstruction);
            }
        }
    }

    /// Memory-protection check: in user mode every physical address must fall
    /// inside [RB, RL].
    fn check_bounds(&self, address: Word) -> bool {
        address >= self.rb && address <= self.rl
    }

    /// Physical address for a memory-touching access, after user relocation.
    /// Raises INT_BAD_ADDR on a bounds violation.
    fn physical_address(&self, effective: Word) -> Option<Word> {
        if self.psw.mode == CpuMode::User {
            let physical = self.rb + effective;
            if !self.check_bounds(physical) {
                warn!("Address {} outside [{}, {}]", physical, self.rb, self.rl);
                self.interrupts.raise(InterruptKind::BadAddress);
                return None;
            }
            Some(physical)
        } else {
            Some(effective)
        }
    }

    fn operand(&mut self, inst: &Instruction, memory: &Memory) -> Option<Word> {
        match inst.address_mode() {
            Some(AddressMode::Immediate) => Some(inst.value()),
            Some(AddressMode::Direct) => {
                let physical = self.physical_address(inst.value())?;
                Some(memory.read(physical))
            }
            Some(AddressMode::Indexed) => {
                let physical = self.physical_address(self.ac + inst.value())?;
                Some(memory.read(physical))
            }
            None => {
                warn!("Invalid addressing mode digit {}", inst.mode_digit());
                self.interrupts.raise(InterruptKind::BadInstruction);
                None
            }
        }
    }

    fn update_cc(&mut self, result: i64) {
        if result.abs() > ALU_MAX as i64 {
            self.psw.cc = CondCode::Overflow;
            self.interrupts.raise(InterruptKind::Overflow);
        } else if result == 0 {
            self.psw.cc = CondCode::Equal;
        } else if result < 0 {
            self.psw.cc = CondCode::Less;
        } else {
            self.psw.cc = CondCode::Greater;
        }
    }

    fn op_alu(&mut self, inst: &Instruction, memory: &Memory, op: AluOp) {
        let Some(operand) = self.operand(inst, memory) else {
            return;
        };
        if matches!(op, AluOp::Div) && operand == 0 {
            warn!("Division by zero");
            self.interrupts.raise(InterruptKind::Overflow);
            return;
        }
        let result = match &op {
            AluOp::Add => self.ac as i64 + operand as i64,
            AluOp::Sub => self.ac as i64 - operand as i64,
            AluOp::Mul => self.ac as i64 * operand as i64,
            AluOp::Div => self.ac as i64 / operand as i64,
        };
        self.update_cc(result);
        if self.psw.cc != CondCode::Overflow {
            self.ac = result as Word;
        }
        debug!(
            "{}: operand={} result={} cc={:?}",
            op.mnemonic(),
            operand,
            result,
            self.psw.cc
        );
    }

    fn op_store(&mut self, inst: &Instruction, memory: &mut Memory) {
        let effective = match inst.address_mode() {
            Some(AddressMode::Direct) => inst.value(),
            Some(AddressMode::Indexed) => self.ac + inst.value(),
            // a store needs an address
            Some(AddressMode::Immediate) | None => {
                self.interrupts.raise(InterruptKind::BadInstruction);
                return;
            }
        };
        let Some(physical) = self.physical_address(effective) else {
            return;
        };
        memory.write(physical, self.ac);
        debug!("STR: memory[{}] = {:08}", physical, self.ac);
    }

    fn op_store_rx(&mut self) {
        if self.psw.mode == CpuMode::User && !self.check_bounds(self.ac) {
            self.interrupts.raise(InterruptKind::BadAddress);
            return;
        }
        self.rx = self.ac;
        debug!("STRRX: RX={}", self.rx);
    }

    fn op_store_sp(&mut self) {
        if self.psw.mode == CpuMode::User && !self.check_bounds(self.rx + self.ac) {
            self.interrupts.raise(InterruptKind::BadAddress);
            return;
        }
        self.sp = self.ac;
        debug!("STRSP: SP={}", self.sp);
    }

    /// SP is RX-relative in user mode and absolute in kernel mode.
    fn stack_base(&self) -> Word {
        match self.psw.mode {
            CpuMode::User => self.rx,
            CpuMode::Kernel => 0,
        }
    }

    fn stack_slot_in_range(&self, slot: Word) -> bool {
        match self.psw.mode {
            CpuMode::User => self.check_bounds(slot),
            CpuMode::Kernel => slot >= 0 && (slot as usize) < MEM_WORDS,
        }
    }

    fn op_push(&mut self, memory: &mut Memory) {
        let slot = self.stack_base() + self.sp + 1;
        if !self.stack_slot_in_range(slot) {
            self.interrupts.raise(InterruptKind::BadAddress);
            return;
        }
        self.sp += 1;
        memory.write(slot, self.ac);
        debug!("PSH: memory[{}] = {:08} SP={}", slot, self.ac, self.sp);
    }

    fn op_pop(&mut self, memory: &Memory) {
        if self.sp <= 0 {
            warn!("Stack underflow on POP");
            self.interrupts.raise(InterruptKind::Underflow);
            return;
        }
        let slot = self.stack_base() + self.sp;
        if !self.stack_slot_in_range(slot) {
            self.interrupts.raise(InterruptKind::BadAddress);
            return;
        }
        self.ac = memory.read(slot);
        self.sp -= 1;
        debug!("POP: AC={:08} SP={}", self.ac, self.sp);
    }

    fn op_return(&mut self, memory: &Memory) {
        if self.sp <= 0 {
            warn!("Stack underflow on RETRN");
            self.interrupts.raise(InterruptKind::Underflow);
            return;
        }
        let slot = self.stack_base() + self.sp;
        if !self.stack_slot_in_range(slot) {
            self.interrupts.raise(InterruptKind::BadAddress);
            return;
        }
        self.psw.pc = memory.read(slot);
        self.sp -= 1;
        debug!("RETRN: PC={} SP={}", self.psw.pc, self.sp);
    }

    fn op_jump(&mut self, inst: &Instruction, memory: &Memory, cond: JumpCond) {
        let taken = match cond {
            JumpCond::Always => true,
            JumpCond::Equal => self.psw.cc == CondCode::Equal,
            JumpCond::NotEqual => self.psw.cc != CondCode::Equal,
            JumpCond::Less => self.psw.cc == CondCode::Less,
            JumpCond::Greater => self.psw.cc == CondCode::Greater,
        };
        if !taken {
            return;
        }
        let Some(target) = self.operand(inst, memory) else {
            return;
        };
        // a trap raised by the operand fetch wins over the branch
        if self.interrupts.is_pending() {
            return;
        }
        if self.psw.mode == CpuMode::User {
            let physical = self.rb + target;
            if !self.check_bounds(physical) {
                warn!("Jump target {} outside [{}, {}]", physical, self.rb, self.rl);
                self.interrupts.raise(InterruptKind::BadAddress);
                return;
            }
            self.psw.pc = physical;
        } else {
            self.psw.pc = target;
        }
        debug!("JMP: PC={}", self.psw.pc);
    }

    fn op_chmod(&mut self, inst: &Instruction) {
        let new_mode = if inst.value() == 0 {
            CpuMode::User
        } else {
            CpuMode::Kernel
        };
        info!("CHMOD: {:?} -> {:?}", self.psw.mode, new_mode);
        self.psw.mode = new_mode;
    }

    /// Pushes AC, RX and the packed PSW onto the caller's stack.
    pub fn save_context(&mut self, memory: &mut Memory) {
        let base = self.stack_base();
        self.sp += 1;
        memory.write(base + self.sp, self.ac);
        self.sp += 1;
        memory.write(base + self.sp, self.rx);
        self.sp += 1;
        memory.write(base + self.sp, self.psw.pack());
        debug!("Context saved: SP={}", self.sp);
    }

    /// Pops PSW, RX and AC back. `stack_mode` selects the stack the context
    /// was saved on; the dispatcher switched to kernel mode in between, so
    /// the current mode cannot be trusted for that.
    pub fn restore_context(&mut self, memory: &Memory, stack_mode: CpuMode) {
        let base = match stack_mode {
            CpuMode::User => self.rx,
            CpuMode::Kernel => 0,
        };
        self.psw = Psw::unpack(memory.read(base + self.sp));
        self.sp -= 1;
        self.rx = memory.read(base + self.sp);
        self.sp -= 1;
        self.ac = memory.read(base + self.sp);
        self.sp -= 1;
        debug!("Context restored: SP={}", self.sp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::instruction::encode;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Fixture {
        interrupts: Arc<InterruptController>,
        bus: Arc<Mutex<Memory>>,
        cpu: Cpu,
        dma: DmaController,
        clock: Clock,
    }

    fn fixture() -> Fixture {
        let interrupts = Arc::new(InterruptController::new());
        let bus = Arc::new(Mutex::new(Memory::new()));
        let dma = DmaController::new(bus.clone(), interrupts.clone(), Duration::from_millis(1));
        let cpu = Cpu::new(interrupts.clone());
        Fixture {
            interrupts,
            bus,
            cpu,
            dma,
            clock: Clock::new(0),
        }
    }

    impl Fixture {
        fn place(&self, base: Word, words: &[Word]) {
            let mut memory = self.bus.lock().unwrap();
            for (i, word) in words.iter().enumerate() {
                memory.write(base + i as Word, *word);
            }
        }

        fn steps(&mut self, n: usize) {
            for _ in 0..n {
                let mut memory = self.bus.lock().unwrap();
                self.cpu.step(&mut memory, &mut self.dma, &mut self.clock);
            }
        }

        fn enter_user(&mut self, rb: Word, rl: Word, rx: Word) {
            self.cpu.set_rb(rb);
            self.cpu.set_rl(rl);
            self.cpu.set_rx(rx);
            self.cpu.set_sp(0);
            self.cpu.set_pc(rb);
            self.cpu.set_mode(CpuMode::User);
        }
    }

    #[test]
    fn arithmetic_updates_ac_and_cc() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 5),
            encode(Opcode::SUM, AddressMode::Immediate, 3),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.cpu.ac(), 8);
        assert_eq!(f.cpu.registers().psw.cc, CondCode::Greater);
        assert!(!f.interrupts.is_pending());
    }

    #[test]
    fn subtraction_below_zero_sets_less() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 3),
            encode(Opcode::RES, AddressMode::Immediate, 5),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.cpu.ac(), -2);
        assert_eq!(f.cpu.registers().psw.cc, CondCode::Less);
    }

    #[test]
    fn divide_by_zero_traps_and_keeps_ac() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 10),
            encode(Opcode::DIVI, AddressMode::Immediate, 0),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::Overflow));
        assert_eq!(f.cpu.ac(), 10);
    }

    #[test]
    fn multiply_overflow_traps_without_committing_ac() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 99_999),
            encode(Opcode::MULT, AddressMode::Immediate, 99_999),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::Overflow));
        assert_eq!(f.cpu.registers().psw.cc, CondCode::Overflow);
        assert_eq!(f.cpu.ac(), 99_999);
    }

    #[test]
    fn user_read_outside_limits_traps() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::LOAD, AddressMode::Direct, 50)]);
        f.enter_user(300, 310, 0);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadAddress));
        assert_eq!(f.cpu.ac(), 0);
    }

    #[test]
    fn user_store_is_relocated() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 7),
            encode(Opcode::STR, AddressMode::Direct, 10),
        ]);
        f.enter_user(300, 400, 350);
        f.steps(2);
        assert_eq!(f.bus.lock().unwrap().read(310), 7);
        assert!(!f.interrupts.is_pending());
    }

    #[test]
    fn kernel_load_returns_the_last_store() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 4321),
            encode(Opcode::STR, AddressMode::Direct, 1500),
            encode(Opcode::LOAD, AddressMode::Immediate, 0),
            encode(Opcode::LOAD, AddressMode::Direct, 1500),
        ]);
        f.cpu.set_pc(300);
        f.steps(4);
        assert_eq!(f.cpu.ac(), 4321);
    }

    #[test]
    fn indexed_addressing_adds_ac() {
        let mut f = fixture();
        f.place(400, &[55]);
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 100),
            encode(Opcode::SUM, AddressMode::Indexed, 300),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.cpu.ac(), 155);
    }

    #[test]
    fn stack_round_trip_in_user_mode() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 42),
            encode(Opcode::PSH, AddressMode::Direct, 0),
            encode(Opcode::LOAD, AddressMode::Immediate, 0),
            encode(Opcode::POP, AddressMode::Direct, 0),
        ]);
        f.enter_user(300, 600, 500);
        f.steps(4);
        assert_eq!(f.cpu.ac(), 42);
        assert_eq!(f.cpu.sp(), 0);
        assert!(!f.interrupts.is_pending());
    }

    #[test]
    fn pop_on_empty_stack_underflows() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::POP, AddressMode::Direct, 0)]);
        f.cpu.set_pc(300);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::Underflow));
    }

    #[test]
    fn privileged_instruction_in_user_mode_traps() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::HAB, AddressMode::Direct, 0)]);
        f.enter_user(300, 400, 0);
        f.cpu.set_interrupts_enabled(true);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadInstruction));
        assert!(f.cpu.interrupts_enabled());
    }

    #[test]
    fn unknown_opcode_traps() {
        let mut f = fixture();
        f.place(300, &[99_000_000]);
        f.cpu.set_pc(300);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadInstruction));
    }

    #[test]
    fn jump_is_taken_on_matching_cc() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::COMP, AddressMode::Immediate, 0),
            encode(Opcode::JMPE, AddressMode::Immediate, 500),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.cpu.pc(), 500);
    }

    #[test]
    fn jump_is_skipped_on_mismatched_cc() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::COMP, AddressMode::Immediate, 5),
            encode(Opcode::JMPE, AddressMode::Immediate, 500),
        ]);
        f.cpu.set_pc(300);
        f.steps(2);
        assert_eq!(f.cpu.pc(), 302);
    }

    #[test]
    fn pending_interrupt_blocks_jump_commit() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::J, AddressMode::Immediate, 500)]);
        f.cpu.set_pc(300);
        f.interrupts.raise(InterruptKind::Clock);
        f.steps(1);
        assert_eq!(f.cpu.pc(), 301);
    }

    #[test]
    fn user_jump_target_is_relocated_and_checked() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::J, AddressMode::Immediate, 99)]);
        f.enter_user(300, 310, 305);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadAddress));
        assert_eq!(f.cpu.pc(), 301);
    }

    #[test]
    fn user_jump_lands_inside_region() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::J, AddressMode::Immediate, 3)]);
        f.enter_user(300, 400, 350);
        f.steps(1);
        assert_eq!(f.cpu.pc(), 303);
    }

    #[test]
    fn fetch_from_stack_region_traps() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::LOADRB, AddressMode::Direct, 0)]);
        f.enter_user(300, 400, 350);
        f.cpu.set_pc(350);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadAddress));
    }

    #[test]
    fn retrn_pops_the_return_address() {
        let mut f = fixture();
        f.place(1, &[777]);
        f.place(300, &[encode(Opcode::RETRN, AddressMode::Direct, 0)]);
        f.cpu.set_pc(300);
        f.cpu.set_sp(1);
        f.steps(1);
        assert_eq!(f.cpu.pc(), 777);
        assert_eq!(f.cpu.sp(), 0);
    }

    #[test]
    fn chmod_selects_the_new_mode() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::CHMOD, AddressMode::Direct, 1),
            encode(Opcode::CHMOD, AddressMode::Direct, 0),
        ]);
        f.cpu.set_pc(300);
        f.steps(1);
        assert_eq!(f.cpu.mode(), CpuMode::Kernel);
        f.steps(1);
        assert_eq!(f.cpu.mode(), CpuMode::User);
    }

    #[test]
    fn strrx_in_user_mode_validates_the_new_base() {
        let mut f = fixture();
        f.place(300, &[
            encode(Opcode::LOAD, AddressMode::Immediate, 50_000),
            encode(Opcode::STRRX, AddressMode::Direct, 0),
        ]);
        f.enter_user(300, 400, 350);
        f.steps(2);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadAddress));
        assert_eq!(f.cpu.registers().rx, 350);
    }

    #[test]
    fn save_restore_round_trips_registers() {
        let mut f = fixture();
        f.cpu.set_ac(123);
        f.cpu.set_rx(450);
        f.cpu.set_sp(2);
        f.cpu.set_pc(305);
        let before = f.cpu.registers();

        let mut memory = f.bus.lock().unwrap();
        f.cpu.save_context(&mut memory);
        assert_eq!(f.cpu.sp(), 5);
        f.cpu.restore_context(&memory, CpuMode::Kernel);

        let after = f.cpu.registers();
        assert_eq!(after.ac, before.ac);
        assert_eq!(after.rx, before.rx);
        assert_eq!(after.sp, before.sp);
        assert_eq!(after.psw, before.psw);
    }

    #[test]
    fn sdma_instructions_configure_and_start_a_transfer() {
        let mut f = fixture();
        f.place(400, &[12345678]);
        f.place(300, &[
            encode(Opcode::SDMAP, AddressMode::Immediate, 1),
            encode(Opcode::SDMAC, AddressMode::Immediate, 2),
            encode(Opcode::SDMAS, AddressMode::Immediate, 3),
            encode(Opcode::SDMAIO, AddressMode::Immediate, 1),
            encode(Opcode::SDMAM, AddressMode::Immediate, 400),
            encode(Opcode::SDMAON, AddressMode::Direct, 0),
        ]);
        f.cpu.set_pc(300);
        f.steps(6);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.interrupts.pending() != Some(InterruptKind::IoDone) {
            assert!(std::time::Instant::now() < deadline, "transfer never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(f.dma.status(), crate::core::dma::DmaStatus::Ok);
        assert!(!f.dma.is_active());
    }

    #[test]
    fn sdma_in_user_mode_traps() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::SDMAON, AddressMode::Direct, 0)]);
        f.enter_user(300, 400, 0);
        f.steps(1);
        assert_eq!(f.interrupts.pending(), Some(InterruptKind::BadInstruction));
        assert!(!f.dma.is_active());
    }

    #[test]
    fn tti_sets_the_clock_period() {
        let mut f = fixture();
        f.place(300, &[encode(Opcode::TTI, AddressMode::Direct, 5)]);
        f.cpu.set_pc(300);
        f.steps(1);
        assert_eq!(f.clock.period(), 5);
    }
}
