//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (spinner) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs; conversion stages show on a live spinner.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → standard logs.
//!
//! Library modules log through the `log` macros; [`init_logging`] installs the global
//! backend at the level matching the notifier.

use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Record};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner, no text logs
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Installs the global `log` backend. Safe to call more than once.
pub fn init_logging(verbosity_level: u8) {
    let level = VerbosityLevel::from(verbosity_level).to_log_level();
    let _ = env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .try_init();
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    spinner: Mutex<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);
        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        Self {
            verbosity,
            logger,
            spinner: Mutex::new(None),
        }
    }

    fn emit(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }

    /// Quiet mode still prints warnings and errors as text.
    fn prints(&self, level: Level) -> bool {
        self.verbosity != VerbosityLevel::Quiet || level <= Level::Warn
    }

    pub fn info(&self, message: &str) {
        if self.prints(Level::Info) {
            self.emit(Level::Info, message);
            return;
        }

        let mut spinner = match self.spinner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pb = spinner.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}")
            {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        });
        pb.set_message(message.to_string());
    }

    pub fn debug(&self, message: &str) {
        if self.prints(Level::Debug) {
            self.emit(Level::Debug, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.prints(Level::Warn) {
            return;
        }
        let spinner = match self.spinner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match spinner.as_ref() {
            Some(pb) => pb.suspend(|| self.emit(Level::Warn, message)),
            None => self.emit(Level::Warn, message),
        }
    }

    /// Ends the spinner (Quiet mode) or logs the final message.
    pub fn finish(&self, message: &str) {
        let spinner = match self.spinner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match spinner {
            Some(pb) => pb.finish_and_clear(),
            None => self.emit(Level::Info, message),
        }
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}
