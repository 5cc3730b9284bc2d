use std::io;
use std::io::Write;
use tracing::error;

use crate::core::system::{RunMode, System, SYS_NAME, SYS_VERSION};

/// Line-oriented operator shell over the system driver.
pub struct Console {
    system: System,
}

impl Console {
    pub fn new(system: System) -> Self {
        Console { system }
    }

    pub fn run(&mut self) {
        println!();
        println!("=============================================");
        println!("  {} v{} - maquina virtual decimal", SYS_NAME, SYS_VERSION);
        println!("=============================================");
        println!();

        loop {
            print!("sistema> ");
            io::stdout().flush().unwrap();

            let mut input = String::new();
            match io::stdin().read_line(&mut input) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            let mut command_iter = input.split_ascii_whitespace();
            match command_iter.next().or_else(|| Some("")).unwrap() {
                "salir" | "exit" => {
                    println!("Saliendo del sistema...");
                    break;
                }
                "ayuda" | "help" => self.print_help(),
                "ejecutar" => {
                    let file = command_iter.next();
                    let mode = match command_iter.next() {
                        Some("debug") => RunMode::Debug,
                        _ => RunMode::Normal,
                    };
                    match file {
                        Some(file) => {
                            if let Err(e) = self.system.run_program(file, mode) {
                                error!("Error al cargar programa {}: {}", file, e);
                                println!("Error al cargar programa: {}", e);
                            } else {
                                println!("\nPrograma finalizado\n");
                            }
                        }
                        None => println!("Uso: ejecutar <archivo> [normal|debug]"),
                    }
                }
                _ => println!("Comando no reconocido. Escribe 'ayuda' para ver comandos."),
            }
        }

        self.system.shutdown();
    }

    fn print_help(&self) {
        println!();
        println!("Comandos disponibles:");
        println!("  ejecutar <archivo> [modo]  - Ejecuta un programa");
        println!("                               modo: normal | debug");
        println!("  ayuda                      - Muestra esta ayuda");
        println!("  salir                      - Sale del sistema");
        println!();
    }
}
