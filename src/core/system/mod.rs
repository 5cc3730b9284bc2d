use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::core::cpu::psw::CpuMode;
use crate::core::cpu::{Cpu, CpuRegisters};
use crate::core::debugger::Debugger;
use crate::core::dma::DmaController;
use crate::core::interrupt::{InterruptController, InterruptKind};
use crate::core::memory::{LoadedProgram, Memory};
use crate::core::word::Word;
use crate::core::{MEM_OS, MEM_WORDS};
use crate::log::Logger;

pub const SYS_NAME: &str = "r-dvm8";
pub const SYS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    Debug,
}

/// Owns every long-lived component and performs one driver step per tick:
/// dispatch a deliverable interrupt, run one CPU cycle under the bus, count
/// the cycle against the clock period, stop once PC leaves memory.
pub struct System {
    cpu: Cpu,
    bus: Arc<Mutex<Memory>>,
    interrupts: Arc<InterruptController>,
    dma: DmaController,
    clock: Clock,
    running: bool,
    stack_size: usize,
    logger: Option<Logger>,
}

impl System {
    pub fn new(config: &Config) -> Self {
        let interrupts = Arc::new(InterruptController::new());
        let bus = Arc::new(Mutex::new(Memory::new()));
        let dma = DmaController::new(
            bus.clone(),
            interrupts.clone(),
            Duration::from_millis(config.dma_latency_ms),
        );
        let cpu = Cpu::new(interrupts.clone());
        let clock = Clock::new(config.clock_period);
        info!(
            "System initialized: {} words of memory, {} reserved for the OS",
            MEM_WORDS, MEM_OS
        );
        System {
            cpu,
            bus,
            interrupts,
            dma,
            clock,
            running: false,
            stack_size: config.stack_size,
            logger: None,
        }
    }

    pub fn attach_logger(&mut self, logger: Logger) {
        self.logger = Some(logger);
    }

    pub fn logger(&self) -> Option<&Logger> {
        self.logger.as_ref()
    }

    pub fn run_program(&mut self, path: &str, mode: RunMode) -> io::Result<()> {
        let source = fs::read_to_string(path)?;
        info!("Program file {} MD5: {:X}", path, md5::compute(source.as_bytes()));
        let program = self.load_source(&source)?;
        info!(
            "Starting execution of '{}' at address {} in {:?} mode",
            program.name, program.start, mode
        );
        match mode {
            RunMode::Normal => self.run_to_halt(),
            RunMode::Debug => Debugger::new().run(self),
        }
        self.dma.shutdown();
        info!("Program finished");
        Ok(())
    }

    /// Places a program image and points the CPU at it: RB = PC = start,
    /// RX just past the code, RL closing the stack region, user mode.
    pub fn load_source(&mut self, source: &str) -> io::Result<LoadedProgram> {
        let program = {
            let mut memory = self.bus.lock().unwrap();
            memory.load_program(source, MEM_OS as Word)?
        };

        let rb = program.start;
        let rx = rb + program.words;
        let rl = rx + self.stack_size as Word - 1;
        if rl as usize >= MEM_WORDS {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("no room for program and stack: limit {} exceeds memory", rl),
            ));
        }

        self.cpu.set_pc(rb);
        self.cpu.set_rb(rb);
        self.cpu.set_rx(rx);
        self.cpu.set_rl(rl);
        self.cpu.set_sp(0);
        self.cpu.set_mode(CpuMode::User);
        self.cpu.set_interrupts_enabled(true);
        self.interrupts.clear();
        self.clock.reset();
        self.running = true;
        Ok(program)
    }

    pub fn step(&mut self) {
        if let Some(kind) = self.interrupts.pending() {
            if kind == InterruptKind::BadAddress && self.interrupts.handler(kind) == 0 {
                error!("Invalid address with no handler installed, stopping");
                self.running = false;
                return;
            }
            let mut memory = self.bus.lock().unwrap();
            let _ = self.interrupts.dispatch(&mut self.cpu, &mut memory);
        }

        if !self.running {
            return;
        }

        // bus arbitration: the cycle owns memory end to end
        {
            let mut memory = self.bus.lock().unwrap();
            self.cpu.step(&mut memory, &mut self.dma, &mut self.clock);
        }

        if self.clock.tick() {
            self.interrupts.raise(InterruptKind::Clock);
        }

        let pc = self.cpu.pc();
        if pc < 0 || pc as usize >= MEM_WORDS {
            info!("PC {} left memory, stopping", pc);
            self.running = false;
        }
    }

    pub fn run_to_halt(&mut self) {
        while self.running {
            self.step();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn shutdown(&mut self) {
        self.dma.shutdown();
    }

    // Introspection surface for the console and debugger.

    pub fn registers(&self) -> CpuRegisters {
        self.cpu.registers()
    }

    pub fn peek_memory(&self, address: Word) -> Option<Word> {
        if address < 0 || address as usize >= MEM_WORDS {
            return None;
        }
        Some(self.bus.lock().unwrap().read(address))
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}
