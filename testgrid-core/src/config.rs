// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration and pre-flight validation.

use crate::errors::ConfigError;
use camino::Utf8PathBuf;
use std::time::Duration;

/// How many workers to run.
///
/// `Count` is clamped against the total number of discovered tasks by the
/// dispatcher at startup; `Auto` resolves to twice the available CPU count;
/// `InController` runs every task on the calling thread with no child
/// processes at all, which is how `--reproduce` runs are forced to execute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parallelism {
    Count(usize),
    Auto,
    InController,
}

impl Parallelism {
    /// Parses the CLI convention: `0` means [`Parallelism::Auto`], `-1`
    /// means [`Parallelism::InController`], anything else is a literal
    /// worker count.
    pub fn from_cli_value(value: i64) -> Self {
        match value {
            0 => Parallelism::Auto,
            -1 => Parallelism::InController,
            n if n > 0 => Parallelism::Count(n as usize),
            _ => Parallelism::InController,
        }
    }

    pub fn resolve(self, total_tasks: usize) -> usize {
        match self {
            Parallelism::Count(n) => n.min(total_tasks.max(1)),
            Parallelism::Auto => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cpus * 2).min(total_tasks.max(1))
            }
            Parallelism::InController => 0,
        }
    }
}

/// The fully-resolved set of knobs a run is started with. Assembled by the
/// CLI from flags/environment and handed to the dispatcher as-is; the
/// dispatcher never re-derives a default from scratch.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub parallelism: Parallelism,
    pub force: bool,
    /// `None` disables the hang detector outright (the CLI's negative-value
    /// convention for "no-output-timeout").
    pub no_output_timeout: Option<Duration>,
    /// The run is under a debugger or profiler; disables the hang detector
    /// regardless of `no_output_timeout`, since those legitimately produce
    /// long silences.
    pub debugger: bool,
    /// The suite is known to contain long-running tests; same effect as
    /// `debugger`.
    pub long_tests: bool,
    pub warn_timeout: Duration,
    pub test_timeout: Duration,
    pub server_start_timeout: Duration,
    pub reproduce: Option<Utf8PathBuf>,
    pub randomize: bool,
    pub vardir: Utf8PathBuf,
    /// The command each worker's driver runs per task, passed through
    /// unchanged to [`crate::worker::WorkerConfig`].
    pub driver_program: String,
    pub driver_args: Vec<String>,
}

impl RunnerConfig {
    /// Validates timeout ordering and the reproduce/randomize interaction,
    /// and applies the "a reproduce run pins pool=1 and disables
    /// randomization" rule described in the specification. Returns the
    /// (possibly adjusted) config on success; nothing here touches the
    /// filesystem beyond confirming the reproduce file, if any, exists.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if let Some(no_output) = self.no_output_timeout {
            let min_test = self.server_start_timeout + Duration::from_secs(20);
            let min_no_output = self.test_timeout + Duration::from_secs(10);
            if self.test_timeout < min_test || no_output < min_no_output {
                return Err(ConfigError::TimeoutOrdering {
                    no_output,
                    test: self.test_timeout,
                    server_start: self.server_start_timeout,
                });
            }
        }

        if let Some(path) = &self.reproduce {
            std::fs::metadata(path).map_err(|e| ConfigError::ReproduceFileMissing {
                path: path.clone(),
                source: e,
            })?;
            self.parallelism = Parallelism::Count(1);
            self.randomize = false;
        }

        Ok(self)
    }

    pub fn hang_detector_enabled(&self) -> bool {
        self.no_output_timeout.is_some() && !self.debugger && !self.long_tests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: &std::path::Path) -> RunnerConfig {
        RunnerConfig {
            parallelism: Parallelism::Count(4),
            force: false,
            no_output_timeout: Some(Duration::from_secs(90)),
            debugger: false,
            long_tests: false,
            warn_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(60),
            server_start_timeout: Duration::from_secs(20),
            reproduce: None,
            randomize: true,
            vardir: Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap(),
            driver_program: "true".to_string(),
            driver_args: Vec::new(),
        }
    }

    #[test]
    fn parallelism_cli_conventions() {
        assert_eq!(Parallelism::from_cli_value(0), Parallelism::Auto);
        assert_eq!(Parallelism::from_cli_value(-1), Parallelism::InController);
        assert_eq!(Parallelism::from_cli_value(5), Parallelism::Count(5));
    }

    #[test]
    fn count_is_clamped_to_total_tasks() {
        assert_eq!(Parallelism::Count(8).resolve(3), 3);
        assert_eq!(Parallelism::Count(2).resolve(3), 2);
    }

    #[test]
    fn well_ordered_timeouts_validate() {
        let dir = tempfile::tempdir().unwrap();
        assert!(base_config(dir.path()).validate().is_ok());
    }

    #[test]
    fn no_output_timeout_too_tight_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.no_output_timeout = Some(Duration::from_secs(5));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TimeoutOrdering { .. })
        ));
    }

    #[test]
    fn disabled_hang_detector_skips_ordering_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.no_output_timeout = None;
        cfg.test_timeout = Duration::from_secs(1);
        cfg.server_start_timeout = Duration::from_secs(100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn reproduce_pins_pool_to_one_and_disables_randomize() {
        let dir = tempfile::tempdir().unwrap();
        let reproduce_file = dir.path().join("01_box.tests.txt");
        std::fs::write(&reproduce_file, "").unwrap();

        let mut cfg = base_config(dir.path());
        cfg.reproduce = Some(Utf8PathBuf::from_path_buf(reproduce_file).unwrap());
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.parallelism, Parallelism::Count(1));
        assert!(!validated.randomize);
    }

    #[test]
    fn debugger_or_long_tests_disables_hang_detector_even_with_timeout_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        assert!(cfg.hang_detector_enabled());

        cfg.debugger = true;
        assert!(!cfg.hang_detector_enabled());

        cfg.debugger = false;
        cfg.long_tests = true;
        assert!(!cfg.hang_detector_enabled());
    }

    #[test]
    fn missing_reproduce_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path());
        cfg.reproduce = Some(Utf8PathBuf::from_path_buf(dir.path().join("nope.txt")).unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ReproduceFileMissing { .. })
        ));
    }
}
