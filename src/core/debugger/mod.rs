use std::io;
use std::io::Write;
use tracing::info;

use crate::core::cpu::disassembler;
use crate::core::cpu::psw::CpuMode;
use crate::core::system::System;
use crate::core::word::Word;

/// Interactive stepper driven between driver steps over the introspection
/// surface of `System`. Line-oriented, on the driver thread: the machine only
/// advances when the operator asks for it.
pub struct Debugger;

impl Debugger {
    pub fn new() -> Self {
        Debugger
    }

    pub fn run(&mut self, system: &mut System) {
        info!("Debugger attached at PC {}", system.registers().psw.pc);
        while system.is_running() {
            self.show_state(system);
            print!("> ");
            io::stdout().flush().unwrap();
            let mut input = String::new();
            match io::stdin().read_line(&mut input) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let mut command_iter = input.trim().split_ascii_whitespace();
            let cmd = command_iter.next().or_else(|| Some("")).unwrap();

            match cmd {
                "" | "s" => {
                    system.step();
                    let regs = system.registers();
                    println!(
                        "Resultado - AC: {:08} | PC: {:05} | SP: {:05}",
                        regs.ac, regs.psw.pc, regs.sp
                    );
                }
                "r" => {
                    println!("\n=== REGISTROS ===");
                    print!("{}", system.registers().dump());
                }
                "m" => self.show_memory(system, command_iter.next()),
                "c" => {
                    system.run_to_halt();
                    println!("\nPrograma finalizado");
                }
                "q" => {
                    system.stop();
                }
                "log" => match (command_iter.next(), system.logger()) {
                    (Some(level), Some(logger)) => logger.set_log_level(level),
                    (None, _) => println!("Uso: log <nivel>"),
                    (_, None) => println!("Logger no disponible"),
                },
                _ => println!(
                    "Comandos: (s)iguiente, (r)egistros, (m)emoria, (c)ontinuar, (q)uit, log <nivel>"
                ),
            }
        }
    }

    fn show_state(&self, system: &System) {
        let regs = system.registers();
        println!("\n--- DEBUGGER ---");
        println!(
            "PC: {:05} | AC: {:08} | SP: {:05}",
            regs.psw.pc, regs.ac, regs.sp
        );
        println!(
            "Modo: {} | CC: {:?} | INT: {}",
            match regs.psw.mode {
                CpuMode::Kernel => "KERNEL",
                CpuMode::User => "USUARIO",
            },
            regs.psw.cc,
            if regs.psw.interrupts_enabled { "ON" } else { "OFF" }
        );
        if let Some(word) = system.peek_memory(regs.psw.pc) {
            println!(
                "Siguiente instruccion [{:05}]: {}",
                regs.psw.pc,
                disassembler::disassemble(word)
            );
        }
        println!("\nComandos: (s)iguiente, (r)egistros, (m)emoria, (c)ontinuar, (q)uit");
    }

    fn show_memory(&self, system: &System, arg: Option<&str>) {
        let address: Option<Word> = match arg {
            Some(text) => text.parse().ok(),
            None => {
                print!("Direccion de memoria: ");
                io::stdout().flush().unwrap();
                let mut line = String::new();
                match io::stdin().read_line(&mut line) {
                    Ok(_) => line.trim().parse().ok(),
                    Err(_) => None,
                }
            }
        };
        match address.and_then(|a| system.peek_memory(a).map(|word| (a, word))) {
            Some((a, word)) => println!("Memoria[{}] = {:08}", a, word),
            None => println!("Direccion invalida"),
        }
    }
}
