//! Driver configuration.
//!
//! Mirrors the shape of this crate's ancestor's `DbOptions`: a plain,
//! `Debug`-derivable struct of independent knobs, built once and treated as
//! immutable for the life of a [`crate::driver::Driver`]. Unlike `DbOptions`
//! there is a nontrivial validation step (`validate`), since a bad
//! `project_path` or `coq_command` should fail before we ever fork a child
//! process, not three messages into a session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DriverError;

/// Hammer's three reconstruction backends get a slice of the total time
/// budget, proportional to the fractions observed in the original driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HammerTimeLimits {
    pub atp: Duration,
    pub reconstr: Duration,
    pub crush: Duration,
}

impl HammerTimeLimits {
    fn from_total(total: Duration) -> Self {
        let secs = total.as_secs_f64();
        HammerTimeLimits {
            atp: Duration::from_secs_f64(secs * 29.0 / 60.0),
            reconstr: Duration::from_secs_f64(secs * 28.0 / 60.0),
            crush: Duration::from_secs_f64(secs * 3.0 / 60.0),
        }
    }
}

/// Configuration for a single driver session.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// argv for the prover subprocess. Defaults to `sertop --implicit --omit_loc`.
    pub coq_command: Vec<String>,
    /// Path of the source file being driven. Its stem (unless it is
    /// `Parameter`, `Prop`, or `Type`) becomes an outer `Module` wrapper
    /// opened at init.
    pub module_path: PathBuf,
    /// Working directory for the subprocess, and the upper bound of the
    /// `_CoqProject` upward walk.
    pub project_path: PathBuf,
    /// Per-message wait.
    pub timeout: Duration,
    /// Preload the hammer plugin and tune its time limits.
    pub use_hammer: bool,
    /// `true`: use `Goals`+`CoqConstr`. `false`: use `EGoals`+`CoqExpr`.
    pub kernel_level_terms: bool,
    /// A failing `cancel_last` triggers full reset+replay.
    pub reset_on_cancel_fail: bool,
    /// Optional path that receives a transcript of outbound sentences.
    pub log_outgoing_messages: Option<PathBuf>,
    /// Diagnostic verbosity, 0 (quiet) upward.
    pub verbose: u8,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            coq_command: vec!["sertop".into(), "--implicit".into(), "--omit_loc".into()],
            module_path: PathBuf::new(),
            project_path: PathBuf::from("."),
            timeout: Duration::from_secs(30),
            use_hammer: false,
            kernel_level_terms: true,
            reset_on_cancel_fail: true,
            log_outgoing_messages: None,
            verbose: 0,
        }
    }
}

impl DriverOptions {
    /// Names for which the outer `Module` wrapper is *not* derived from the
    /// module path's stem.
    const NO_WRAP_STEMS: [&'static str; 3] = ["Parameter", "Prop", "Type"];

    /// Validate the configuration before it is used to spawn anything.
    ///
    /// Checked here rather than left to surface as an I/O error the first
    /// time a command is run, so a caller gets one clear message instead of
    /// a broken-pipe error three steps later.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.coq_command.is_empty() {
            return Err(DriverError::InvalidConfig {
                message: "coq_command must name at least the executable".into(),
            });
        }
        if !self.project_path.is_dir() {
            return Err(DriverError::InvalidConfig {
                message: format!("project_path {:?} is not a directory", self.project_path),
            });
        }
        Ok(())
    }

    /// The name of the outer `Module` wrapper to open at init, or `None` if
    /// the module path's stem is one of the reserved names that must not be
    /// wrapped.
    pub fn wrapper_module_name(&self) -> Option<String> {
        let stem = self.module_path.file_stem()?.to_str()?;
        if Self::NO_WRAP_STEMS.contains(&stem) {
            None
        } else {
            Some(stem.to_string())
        }
    }

    pub fn hammer_time_limits(&self) -> HammerTimeLimits {
        HammerTimeLimits::from_total(self.timeout)
    }

    /// Resolve `module_path` relative to `project_path` when it is not
    /// already absolute, matching the original driver's convention that
    /// paths are interpreted relative to the project root.
    pub fn resolved_module_path(&self) -> PathBuf {
        if self.module_path.is_absolute() {
            self.module_path.clone()
        } else {
            self.project_path.join(&self.module_path)
        }
    }
}

/// Builder for [`DriverOptions`], for callers (notably the CLI) assembling
/// the config incrementally from parsed flags.
#[derive(Debug, Default)]
pub struct DriverOptionsBuilder {
    opts: DriverOptions,
}

impl DriverOptionsBuilder {
    pub fn new() -> Self {
        DriverOptionsBuilder { opts: DriverOptions::default() }
    }

    pub fn coq_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opts.coq_command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn module_path(mut self, p: impl AsRef<Path>) -> Self {
        self.opts.module_path = p.as_ref().to_path_buf();
        self
    }

    pub fn project_path(mut self, p: impl AsRef<Path>) -> Self {
        self.opts.project_path = p.as_ref().to_path_buf();
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.opts.timeout = d;
        self
    }

    pub fn use_hammer(mut self, v: bool) -> Self {
        self.opts.use_hammer = v;
        self
    }

    pub fn kernel_level_terms(mut self, v: bool) -> Self {
        self.opts.kernel_level_terms = v;
        self
    }

    pub fn reset_on_cancel_fail(mut self, v: bool) -> Self {
        self.opts.reset_on_cancel_fail = v;
        self
    }

    pub fn log_outgoing_messages(mut self, p: Option<PathBuf>) -> Self {
        self.opts.log_outgoing_messages = p;
        self
    }

    pub fn verbose(mut self, v: u8) -> Self {
        self.opts.verbose = v;
        self
    }

    pub fn build(self) -> Result<DriverOptions, DriverError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_module_name_skips_reserved_stems() {
        let mut opts = DriverOptions::default();
        opts.module_path = PathBuf::from("/proj/Prop.v");
        assert_eq!(opts.wrapper_module_name(), None);
        opts.module_path = PathBuf::from("/proj/Foo.v");
        assert_eq!(opts.wrapper_module_name(), Some("Foo".to_string()));
    }

    #[test]
    fn hammer_time_limits_split_proportionally() {
        let opts = DriverOptions { timeout: Duration::from_secs(60), ..DriverOptions::default() };
        let limits = opts.hammer_time_limits();
        assert_eq!(limits.atp, Duration::from_secs(29));
        assert_eq!(limits.reconstr, Duration::from_secs(28));
        assert_eq!(limits.crush, Duration::from_secs(3));
    }

    #[test]
    fn validate_rejects_missing_project_path() {
        let opts = DriverOptions { project_path: PathBuf::from("/no/such/dir"), ..DriverOptions::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_accepts_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let opts = DriverOptions { project_path: dir.path().to_path_buf(), ..DriverOptions::default() };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn builder_rejects_empty_coq_command() {
        let dir = tempfile::tempdir().unwrap();
        let result = DriverOptionsBuilder::new()
            .project_path(dir.path())
            .coq_command(Vec::<String>::new())
            .build();
        assert!(result.is_err());
    }
}
