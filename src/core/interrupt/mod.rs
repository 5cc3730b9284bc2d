/*
  Interrupt codes
  0  INT_BAD_SYSCODE  invalid system-call code
  1  INT_BAD_IRQ      invalid interrupt code
  2  INT_SYSCALL      system call (SVC)
  3  INT_CLOCK        clock period expired
  4  INT_IO_DONE      DMA transfer finished
  5  INT_BAD_INST     invalid or privileged instruction
  6  INT_BAD_ADDR     address outside [RB, RL]
  7  INT_UNDERFLOW    stack underflow
  8  INT_OVERFLOW     arithmetic overflow / divide by zero
 */

use std::sync::Mutex;
use tracing::{info, warn};

use crate::core::cpu::Cpu;
use crate::core::cpu::psw::CpuMode;
use crate::core::memory::Memory;
use crate::core::word::Word;

pub const VECTOR_ENTRIES: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    BadSyscode = 0,
    BadIrq = 1,
    Syscall = 2,
    Clock = 3,
    IoDone = 4,
    BadInstruction = 5,
    BadAddress = 6,
    Underflow = 7,
    Overflow = 8,
}

impl InterruptKind {
    pub fn from_code(code: Word) -> Option<InterruptKind> {
        use InterruptKind::*;
        match code {
            0 => Some(BadSyscode),
            1 => Some(BadIrq),
            2 => Some(Syscall),
            3 => Some(Clock),
            4 => Some(IoDone),
            5 => Some(BadInstruction),
            6 => Some(BadAddress),
            7 => Some(Underflow),
            8 => Some(Overflow),
            _ => None,
        }
    }

    pub fn code(self) -> Word {
        self as Word
    }

    pub fn description(self) -> &'static str {
        use InterruptKind::*;
        match self {
            BadSyscode => "Codigo de llamada al sistema invalido",
            BadIrq => "Codigo de interrupcion invalido",
            Syscall => "Llamada al sistema",
            Clock => "Interrupcion de reloj",
            IoDone => "Finalizacion de operacion E/S",
            BadInstruction => "Instruccion invalida",
            BadAddress => "Direccionamiento invalido",
            Underflow => "Underflow",
            Overflow => "Overflow",
        }
    }

    /// Critical kinds are delivered even while interrupts are disabled.
    pub fn is_critical(self) -> bool {
        use InterruptKind::*;
        matches!(self, Overflow | Underflow | BadAddress | BadInstruction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub kind: InterruptKind,
    pub handled: bool,
}

/// Single-slot latched pending interrupt plus the handler vector table.
///
/// `raise` may be called from any thread (CPU or DMA worker); the latch is
/// mutex-guarded so no raise is torn or lost across threads. The dispatcher
/// runs on the driver thread only.
pub struct InterruptController {
    latch: Mutex<Option<InterruptKind>>,
    vector: Mutex<[Word; VECTOR_ENTRIES]>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(None),
            vector: Mutex::new([0; VECTOR_ENTRIES]),
        }
    }

    pub fn raise_code(&self, code: Word) {
        match InterruptKind::from_code(code) {
            Some(kind) => self.raise(kind),
            None => {
                warn!("Invalid interrupt code {}", code);
                self.raise(InterruptKind::BadIrq);
            }
        }
    }

    pub fn raise(&self, kind: InterruptKind) {
        let mut latch = self.latch.lock().unwrap();
        if let Some(previous) = *latch {
            warn!(
                "Interrupt {} overwrites pending {}",
                kind.code(),
                previous.code()
            );
        }
        *latch = Some(kind);
        info!("Interrupt raised: code {} - {}", kind.code(), kind.description());
    }

    pub fn is_pending(&self) -> bool {
        self.latch.lock().unwrap().is_some()
    }

    pub fn pending(&self) -> Option<InterruptKind> {
        *self.latch.lock().unwrap()
    }

    pub fn clear(&self) {
        *self.latch.lock().unwrap() = None;
    }

    pub fn install_handler(&self, kind: InterruptKind, address: Word) {
        self.vector.lock().unwrap()[kind.code() as usize] = address;
        info!("Handler for interrupt {} installed at {}", kind.code(), address);
    }

    pub fn handler(&self, kind: InterruptKind) -> Word {
        self.vector.lock().unwrap()[kind.code() as usize]
    }

    /// Delivers the pending interrupt, if any.
    ///
    /// The latch stays locked for the whole delivery so a concurrent raise
    /// lands after it and remains latched for the next step. Save and restore
    /// bracket the handler in the same call; the handler address is logged and
    /// PC momentarily points at it.
    pub fn dispatch(&self, cpu: &mut Cpu, memory: &mut Memory) -> Option<Dispatched> {
        let mut latch = self.latch.lock().unwrap();
        let kind = (*latch)?;

        if !cpu.interrupts_enabled() && !kind.is_critical() {
            return None;
        }

        info!(
            "Dispatching interrupt: code {} - {}",
            kind.code(),
            kind.description()
        );

        let previous_mode = cpu.mode();
        cpu.save_context(memory);
        cpu.set_mode(CpuMode::Kernel);
        cpu.set_interrupts_enabled(false);

        let handler = self.handler(kind);
        let handled = handler > 0;
        if handled {
            info!("Interrupt {} handled at address {}", kind.code(), handler);
            cpu.set_pc(handler);
        } else {
            info!(
                "No handler for interrupt {}, execution continues",
                kind.code()
            );
        }

        *latch = None;

        cpu.restore_context(memory, previous_mode);
        cpu.set_mode(previous_mode);
        cpu.set_interrupts_enabled(true);

        Some(Dispatched { kind, handled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::core::cpu::psw::CondCode;
    use crate::core::MEM_OS;

    fn fixture() -> (Arc<InterruptController>, Cpu, Memory) {
        let interrupts = Arc::new(InterruptController::new());
        let cpu = Cpu::new(interrupts.clone());
        (interrupts, cpu, Memory::new())
    }

    #[test]
    fn raise_latches_code() {
        let (interrupts, _, _) = fixture();
        assert!(!interrupts.is_pending());
        interrupts.raise(InterruptKind::Clock);
        assert_eq!(interrupts.pending(), Some(InterruptKind::Clock));
    }

    #[test]
    fn raise_overwrites_pending() {
        let (interrupts, _, _) = fixture();
        interrupts.raise(InterruptKind::Clock);
        interrupts.raise(InterruptKind::Overflow);
        assert_eq!(interrupts.pending(), Some(InterruptKind::Overflow));
    }

    #[test]
    fn invalid_code_becomes_bad_irq() {
        let (interrupts, _, _) = fixture();
        interrupts.raise_code(42);
        assert_eq!(interrupts.pending(), Some(InterruptKind::BadIrq));
    }

    #[test]
    fn dispatch_without_pending_does_nothing() {
        let (interrupts, mut cpu, mut memory) = fixture();
        assert_eq!(interrupts.dispatch(&mut cpu, &mut memory), None);
    }

    #[test]
    fn non_critical_stays_latched_while_disabled() {
        let (interrupts, mut cpu, mut memory) = fixture();
        cpu.set_interrupts_enabled(false);
        interrupts.raise(InterruptKind::Clock);
        assert_eq!(interrupts.dispatch(&mut cpu, &mut memory), None);
        assert_eq!(interrupts.pending(), Some(InterruptKind::Clock));
    }

    #[test]
    fn critical_is_delivered_while_disabled() {
        let (interrupts, mut cpu, mut memory) = fixture();
        cpu.set_interrupts_enabled(false);
        interrupts.raise(InterruptKind::Overflow);
        let dispatched = interrupts.dispatch(&mut cpu, &mut memory).unwrap();
        assert_eq!(dispatched.kind, InterruptKind::Overflow);
        assert!(!dispatched.handled);
        assert!(!interrupts.is_pending());
    }

    #[test]
    fn dispatch_preserves_cpu_state() {
        let (interrupts, mut cpu, mut memory) = fixture();
        cpu.set_ac(1234);
        cpu.set_pc(MEM_OS as Word + 10);
        let before = cpu.registers();
        interrupts.raise(InterruptKind::Syscall);
        let dispatched = interrupts.dispatch(&mut cpu, &mut memory).unwrap();
        assert_eq!(dispatched.kind, InterruptKind::Syscall);

        let after = cpu.registers();
        assert_eq!(after.ac, before.ac);
        assert_eq!(after.rx, before.rx);
        assert_eq!(after.sp, before.sp);
        assert_eq!(after.psw.pc, before.psw.pc);
        assert_eq!(after.psw.cc, CondCode::Equal);
        assert!(after.psw.interrupts_enabled);
    }

    #[test]
    fn dispatch_reports_installed_handler() {
        let (interrupts, mut cpu, mut memory) = fixture();
        interrupts.install_handler(InterruptKind::Syscall, 120);
        assert_eq!(interrupts.handler(InterruptKind::Syscall), 120);
        interrupts.raise(InterruptKind::Syscall);
        let dispatched = interrupts.dispatch(&mut cpu, &mut memory).unwrap();
        assert!(dispatched.handled);
        // the bracketed restore puts the interrupted PC back
        assert_ne!(cpu.pc(), 120);
    }
}
