use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};
use tracing_subscriber::prelude::*;

pub struct Logger {
    reload_handle: reload::Handle<EnvFilter, Registry>,
}

impl Logger {
    pub fn new(initial_level: &str, log_file: &Path) -> Self {
        let filter = EnvFilter::new(initial_level);
        let (filter_layer, reload_handle) = reload::Layer::new(filter);

        let registry = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer());

        match File::create(log_file) {
            Ok(file) => {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                    .init();
            }
            Err(e) => {
                registry.init();
                tracing::warn!("Could not create log file {}: {}", log_file.display(), e);
            }
        }

        Self { reload_handle }
    }

    pub fn set_log_level(&self, level: &str) {
        self.reload_handle
            .modify(|f| *f = EnvFilter::new(level))
            .unwrap();
    }
}
