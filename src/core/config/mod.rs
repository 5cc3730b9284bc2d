use std::fs;
use std::io;
use std::path::Path;
use serde::{Deserialize, Serialize};

fn default_stack_size() -> usize {
    100
}

fn default_clock_period() -> u64 {
    0
}

fn default_dma_latency_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "sistema.log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Words reserved above the loaded program for its stack.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// Cycles between clock interrupts; 0 leaves the clock off until TTI sets it.
    #[serde(default = "default_clock_period")]
    pub clock_period: u64,
    /// Simulated seek plus rotational delay before a DMA transfer touches the bus.
    #[serde(default = "default_dma_latency_ms")]
    pub dma_latency_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            clock_period: default_clock_period(),
            dma_latency_ms: default_dma_latency_ms(),
            log_level: default_log_level(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> io::Result<Config> {
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid configuration {}: {}", path.display(), e),
            )
        })
    }
}
