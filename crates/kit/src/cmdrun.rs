//! External command execution with dry-run suppression.
//!
//! Every shell-level mutation in the clone transaction goes through
//! [`CommandRunner`]. Under dry-run nothing is spawned and empty output is
//! returned, except for calls marked [`RunOpts::dry`] which are read-only
//! probes (`lvs`, `virsh list`) that must run to produce useful output.

use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Per-invocation options for [`CommandRunner::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOpts {
    /// Suppress the debug echo of the command line.
    pub quiet: bool,
    /// Downgrade a nonzero exit status to a warning instead of an error.
    pub ignore_errors: bool,
    /// Execute even under global dry-run (read-only probes only).
    pub dry: bool,
}

impl RunOpts {
    /// Options for a quiet, read-only probe that runs even under dry-run.
    pub fn probe() -> Self {
        Self {
            quiet: true,
            dry: true,
            ..Default::default()
        }
    }

    /// Options that tolerate a nonzero exit status.
    pub fn tolerant() -> Self {
        Self {
            ignore_errors: true,
            ..Default::default()
        }
    }

    /// Options that suppress the command echo.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }
}

/// Captured output of a completed command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

/// Executes external commands on behalf of the clone transaction.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner<'a> {
    settings: &'a Settings,
}

impl<'a> CommandRunner<'a> {
    /// Create a runner bound to the given settings.
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// The settings this runner was created with.
    pub fn settings(&self) -> &'a Settings {
        self.settings
    }

    /// Run `argv`, capturing stdout and stderr.
    ///
    /// A nonzero exit status is fatal unless `opts.ignore_errors` is set;
    /// there is no retry. Under dry-run (and without `opts.dry`) the command
    /// is not spawned and empty output is returned.
    pub fn run<S: AsRef<str>>(&self, argv: &[S], opts: RunOpts) -> Result<CmdOutput> {
        let argv: Vec<&str> = argv.iter().map(|s| s.as_ref()).collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Precondition("empty command line".into()))?;

        if !opts.quiet {
            let echo = shlex::try_join(argv.iter().copied()).unwrap_or_else(|_| argv.join(" "));
            debug!("- {}", echo);
        }

        if self.settings.dry_run && !opts.dry {
            return Ok(CmdOutput::default());
        }

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if opts.ignore_errors {
                warn!(
                    "{} returned status {}: {} (ignored)",
                    program,
                    status,
                    stderr.trim()
                );
            } else {
                return Err(Error::CommandFailed {
                    program: program.to_string(),
                    status,
                    stderr: stderr.trim().to_string(),
                });
            }
        }

        Ok(CmdOutput { stdout, stderr })
    }

    /// Run `argv` inside the configured chroot.
    pub fn chroot<S: AsRef<str>>(&self, argv: &[S], opts: RunOpts) -> Result<CmdOutput> {
        let mut full: Vec<&str> = vec!["chroot", self.settings.chroot.as_str()];
        full.extend(argv.iter().map(|s| s.as_ref()));
        self.run(&full, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_settings() -> Settings {
        Settings {
            dry_run: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_argv_rejected() {
        let settings = Settings::default();
        let runner = CommandRunner::new(&settings);
        let err = runner.run::<&str>(&[], RunOpts::default()).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_dry_run_suppresses_spawn() {
        let settings = dry_settings();
        let runner = CommandRunner::new(&settings);
        // "false" would fail if spawned; under dry-run it never is.
        let out = runner.run(&["false"], RunOpts::default()).unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "");
    }

    #[test]
    fn test_probe_runs_under_dry_run() {
        let settings = dry_settings();
        let runner = CommandRunner::new(&settings);
        let out = runner.run(&["echo", "probe"], RunOpts::probe()).unwrap();
        assert_eq!(out.stdout.trim(), "probe");
    }

    #[test]
    fn test_nonzero_exit_is_fatal() {
        let settings = Settings::default();
        let runner = CommandRunner::new(&settings);
        let err = runner.run(&["false"], RunOpts::default()).unwrap_err();
        match err {
            Error::CommandFailed {
                program, status, ..
            } => {
                assert_eq!(program, "false");
                assert_eq!(status, "1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ignore_errors_downgrades() {
        let settings = Settings::default();
        let runner = CommandRunner::new(&settings);
        runner.run(&["false"], RunOpts::tolerant()).unwrap();
    }

    #[test]
    fn test_output_captured() {
        let settings = Settings::default();
        let runner = CommandRunner::new(&settings);
        let out = runner.run(&["echo", "hello"], RunOpts::quiet()).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }
}
