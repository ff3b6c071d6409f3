use std::fmt;

use anstream::{eprint, print};

/// Where and how much to print.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Printer {
    /// Suppress all output.
    Silent,
    /// Suppress most output.
    Quiet,
    /// Standard output.
    #[default]
    Default,
    /// Standard output with progress bars disabled.
    NoProgress,
    /// Verbose output.
    Verbose,
}

impl Printer {
    /// Return the [`Stdout`] stream for this printer.
    pub(crate) fn stdout(self) -> Stdout {
        match self {
            Self::Silent | Self::Quiet => Stdout::Disabled,
            Self::Default | Self::NoProgress | Self::Verbose => Stdout::Enabled,
        }
    }

    /// Return the [`Stderr`] stream for this printer.
    pub(crate) fn stderr(self) -> Stderr {
        match self {
            Self::Silent => Stderr::Disabled,
            Self::Quiet | Self::Default | Self::NoProgress | Self::Verbose => Stderr::Enabled,
        }
    }

    /// Whether progress bars should be drawn.
    pub(crate) fn progress_enabled(self) -> bool {
        matches!(self, Self::Default | Self::Verbose)
    }

    pub(crate) fn is_verbose(self) -> bool {
        matches!(self, Self::Verbose)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stdout {
    Enabled,
    Disabled,
}

impl fmt::Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self {
            Self::Enabled => {
                #[allow(clippy::print_stdout, clippy::ignored_unit_patterns)]
                {
                    print!("{s}");
                }
            }
            Self::Disabled => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stderr {
    Enabled,
    Disabled,
}

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self {
            Self::Enabled => {
                #[allow(clippy::print_stderr, clippy::ignored_unit_patterns)]
                {
                    eprint!("{s}");
                }
            }
            Self::Disabled => {}
        }
        Ok(())
    }
}
