use std::fmt;

use bampipe_config::ConfigError;
use bampipe_manager::BamError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn config_error(context: &str, err: ConfigError) -> CliError {
    let code = match err {
        ConfigError::Read { .. } => FAILURE,
        ConfigError::SchemaCompile(_) => INTERNAL,
        ConfigError::TooLarge { .. }
        | ConfigError::InvalidJson(_)
        | ConfigError::Invalid { .. }
        | ConfigError::Semantic(_) => DATA_INVALID,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn bam_error(context: &str, err: BamError) -> CliError {
    match err {
        BamError::Config(err) => config_error(context, err),
        BamError::InvalidArgument(_)
        | BamError::OutOfRange { .. }
        | BamError::UnknownInstance(_) => CliError::new(USAGE, format!("{context}: {err}")),
        BamError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BamError::NotFound(_)
        | BamError::AllocationFailure(_)
        | BamError::BackendFailure(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        BamError::Shutdown => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn bad_tables_are_data_errors() {
        let err = config_error("load", ConfigError::Semantic("empty".into()));
        assert_eq!(err.code, DATA_INVALID);
        assert_eq!(err.to_string(), "load: inconsistent pipe table: empty");
    }

    #[test]
    fn manager_errors_map_to_exit_codes() {
        assert_eq!(
            bam_error("x", BamError::UnknownInstance("ufs".into())).code,
            USAGE
        );
        let timeout = BamError::Timeout {
            what: "USB_PROD Granted".into(),
            after: Duration::from_secs(10),
        };
        assert_eq!(bam_error("x", timeout).code, TIMEOUT);
        assert_eq!(bam_error("x", BamError::Shutdown).code, INTERNAL);
    }
}
