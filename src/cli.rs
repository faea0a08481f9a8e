use std::ffi::OsString;

use clap::error::ErrorKind;
use clap::Parser;
use thiserror::Error;

/// Cell counting HTTP service.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "cellcount", version, about)]
pub struct Args {
    /// TCP port to listen on.
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("Usage: cellcount <port>")]
    Usage,
    #[error("Invalid port number. Please provide a valid integer.")]
    InvalidPort,
    /// `--help` / `--version` output.
    #[error("{0}")]
    Info(String),
}

impl ArgsError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ArgsError::Info(_) => 0,
            _ => 1,
        }
    }
}

/// Parse `argv` (program name first).
pub fn parse_args<I, T>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(args).map_err(|err| match err.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => ArgsError::Info(err.to_string()),
        ErrorKind::ValueValidation | ErrorKind::InvalidValue => ArgsError::InvalidPort,
        _ => ArgsError::Usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_integer_port() {
        assert_eq!(parse_args(["cellcount", "8080"]).unwrap().port, 8080);
    }

    #[test]
    fn missing_port_prints_usage() {
        let err = parse_args(["cellcount"]).unwrap_err();
        assert_eq!(err, ArgsError::Usage);
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "Usage: cellcount <port>");
    }

    #[test]
    fn extra_arguments_print_usage() {
        assert_eq!(
            parse_args(["cellcount", "8080", "9090"]).unwrap_err(),
            ArgsError::Usage
        );
    }

    #[test]
    fn non_integer_port_is_invalid() {
        for bad in ["abc", "80.5", "70000"] {
            let err = parse_args(["cellcount", bad]).unwrap_err();
            assert_eq!(err, ArgsError::InvalidPort, "{bad:?}");
            assert_ne!(err.exit_code(), 0);
        }
    }

    #[test]
    fn help_exits_cleanly() {
        let err = parse_args(["cellcount", "--help"]).unwrap_err();
        assert!(matches!(err, ArgsError::Info(_)));
        assert_eq!(err.exit_code(), 0);
    }
}
