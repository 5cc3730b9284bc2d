use std::io;
use regex::Regex;
use tracing::{debug, error, info};

use crate::core::word::{Word, WORD_MAX};
use crate::core::{MEM_OS, MEM_WORDS};

/// A program placed in memory by the loader.
#[derive(Debug, Clone)]
pub struct LoadedProgram {
    pub name: String,
    pub start: Word,
    pub words: Word,
}

/// Flat word-addressable store with an advisory occupancy map.
///
/// Out-of-range accesses are logged and ignored here; base/limit enforcement
/// for user programs is the CPU's job.
pub struct Memory {
    words: Vec<Word>,
    occupied: Vec<bool>,
}

impl Memory {
    pub fn new() -> Self {
        let mut memory = Memory {
            words: vec![0; MEM_WORDS],
            occupied: vec![false; MEM_WORDS],
        };
        // the bottom region belongs to the OS image
        for cell in memory.occupied[..MEM_OS].iter_mut() {
            *cell = true;
        }
        memory
    }

    pub fn read(&self, address: Word) -> Word {
        if address < 0 || address as usize >= MEM_WORDS {
            error!("Memory read out of range: {}", address);
            return 0;
        }
        self.words[address as usize]
    }

    pub fn write(&mut self, address: Word, value: Word) {
        if address < 0 || address as usize >= MEM_WORDS {
            error!("Memory write out of range: {}", address);
            return;
        }
        self.words[address as usize] = value;
    }

    pub fn is_occupied(&self, address: Word) -> bool {
        if address < 0 || address as usize >= MEM_WORDS {
            return false;
        }
        self.occupied[address as usize]
    }

    /*
      Program file format (line-oriented ASCII):

        _start <decimal base>
        .NumeroPalabras <decimal count>
        .NombreProg <name>
        <8-digit instruction>
        ...

      Lines before .NombreProg are metadata; numeric lines after it are code,
      placed sequentially from the base. Anything else is skipped.
     */
    pub fn load_program(&mut self, source: &str, base: Word) -> io::Result<LoadedProgram> {
        let start_re = Regex::new(r"^_start\s+(\d+)").unwrap();
        let words_re = Regex::new(r"^\.NumeroPalabras\s+(\d+)").unwrap();
        let name_re = Regex::new(r"^\.NombreProg\s+(\S+)").unwrap();

        let mut start = base;
        let mut position = base;
        let mut declared_words: Word = 0;
        let mut name = String::new();
        let mut in_code = false;
        let mut placed: Word = 0;

        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = start_re.captures(line) {
                start = parse_field(&caps[1], "_start")?;
                position = start;
                continue;
            }
            if let Some(caps) = words_re.captures(line) {
                declared_words = parse_field(&caps[1], ".NumeroPalabras")?;
                continue;
            }
            if let Some(caps) = name_re.captures(line) {
                name = caps[1].to_string();
                in_code = true;
                continue;
            }

            if in_code && line.as_bytes()[0].is_ascii_digit() {
                let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
                let word = parse_field(&digits, "instruction")?;
                if position < 0 || position as usize >= MEM_WORDS {
                    error!("Program does not fit in memory at address {}", position);
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        format!("program exceeds memory at address {}", position),
                    ));
                }
                self.words[position as usize] = word;
                self.occupied[position as usize] = true;
                debug!("Loaded memory[{}] = {:08}", position, word);
                position += 1;
                placed += 1;
            }
        }

        if !in_code {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed program: missing .NombreProg header",
            ));
        }

        let words = if declared_words > 0 { declared_words } else { placed };
        info!("Program '{}' loaded: {} words from address {}", name, words, start);
        Ok(LoadedProgram { name, start, words })
    }
}

fn parse_field(digits: &str, what: &str) -> io::Result<Word> {
    match digits.parse::<i64>() {
        Ok(value) if value <= WORD_MAX as i64 => Ok(value as Word),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed program: bad {} value '{}'", what, digits),
        )),
    }
}
