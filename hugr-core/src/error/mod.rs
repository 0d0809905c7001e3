use std::fmt::Display;
use std::fmt::Formatter;

use apollo_compiler::InvalidNameError;
use apollo_compiler::validation::DiagnosticList;
use apollo_compiler::validation::WithErrors;

/// Create an internal error.
///
/// # Example
/// ```rust
/// use hugr_core::internal_error;
/// use hugr_core::error::HugrError;
/// # fn may_be_none() -> Option<()> { None }
///
/// const NAME: &str = "the thing";
/// let result: Result<(), HugrError> = may_be_none()
///     .ok_or_else(|| internal_error!("Expected {NAME} to be Some"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::HugrError::internal(format!( $( $arg )+ ))
    }
}

/// Break out of the current function, returning an internal error.
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ).into())
    }
}

/// A safe assertion: in debug mode, it panicks on failure, and in production, it returns an
/// internal error.
///
/// Treat this as an assertion. It must only be used for conditions that *should never happen*
/// in normal operation.
#[macro_export]
macro_rules! ensure {
    ( $expr:expr, $( $arg:tt )+ ) => {
        #[cfg(debug_assertions)]
        {
            if false {
                return Err($crate::error::HugrError::internal("ensure!() must be used in a function that returns a Result".to_owned()).into());
            }
            assert!($expr, $( $arg )+);
        }

        #[cfg(not(debug_assertions))]
        if !$expr {
            $crate::bail!( $( $arg )+ );
        }
    }
}

/// Stable error codes surfaced to clients in `errors[].extensions.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorCode {
    #[strum(to_string = "INVALID_ARGUMENT_VALUE")]
    InvalidArgumentValue,
    #[strum(to_string = "PERMISSION_DENIED")]
    PermissionDenied,
    #[strum(to_string = "DEPTH_EXCEEDED")]
    DepthExceeded,
    #[strum(to_string = "RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    #[strum(to_string = "SCHEMA_ERROR")]
    SchemaError,
    #[strum(to_string = "EXECUTION_ERROR")]
    ExecutionError,
    #[strum(to_string = "UPSTREAM_ERROR")]
    UpstreamError,
    #[strum(to_string = "CACHE_ERROR")]
    CacheError,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SingleHugrError {
    #[error(
        "An internal error has occurred, please report this bug to Hugr.\n\nDetails: {message}"
    )]
    Internal { message: String },
    #[error(transparent)]
    InvalidGraphQlName(#[from] InvalidNameError),
    // InvalidGraphQl: we need to be able to modify the message text coming out of
    // apollo-compiler, so the DiagnosticData is formatted into a String here.
    #[error("{message}")]
    InvalidGraphQl { message: String },

    // Configuration
    #[error("environment variable \"{name}\" referenced by \"{referenced_by}\" is not set")]
    MissingEnvVariable { name: String, referenced_by: String },
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Catalog
    #[error("failed to fetch catalog \"{catalog}\": {message}")]
    CatalogFetch { catalog: String, message: String },
    #[error("failed to parse catalog document \"{document}\": {message}")]
    CatalogParse { document: String, message: String },

    // Schema assembly
    #[error("dependency cycle detected between data sources: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("data source \"{source_name}\" declares a dependency on unknown data source \"{dependency}\"")]
    UnknownDependency {
        source_name: String,
        dependency: String,
    },
    #[error(
        "type name prefix collision: \"{type_name}\" is generated by both \"{first}\" and \"{second}\""
    )]
    PrefixCollision {
        type_name: String,
        first: String,
        second: String,
    },
    #[error("duplicate definition of \"{type_name}.{field_name}\"")]
    DuplicateField {
        type_name: String,
        field_name: String,
    },
    #[error(
        "type \"{type_name}\" is defined by more than one catalog of data source \"{source_name}\""
    )]
    DuplicateType {
        type_name: String,
        source_name: String,
    },
    #[error("unsupported directive @{directive} on \"{location}\"")]
    UnsupportedDirective { directive: String, location: String },
    #[error("type \"{type_name}\" referenced by \"{referenced_by}\" cannot be resolved")]
    TypeNotResolvable {
        type_name: String,
        referenced_by: String,
    },

    // Operation validation
    #[error("unknown field \"{field_name}\" on type \"{type_name}\"")]
    InvalidFieldName {
        type_name: String,
        field_name: String,
    },
    #[error("invalid value for argument \"{argument}\" of \"{field}\": {message}")]
    InvalidArgumentValue {
        field: String,
        argument: String,
        message: String,
    },
    #[error("operator \"{operator}\" is not applicable to \"{type_name}\"")]
    WrongOperator { type_name: String, operator: String },
    #[error("operation depth {depth} exceeds the configured maximum of {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },
    #[error("type mismatch: expected \"{expected}\", found \"{actual}\"")]
    TypeMismatch { expected: String, actual: String },
    #[error("type \"{type_name}\" has no primary key")]
    MissingPrimaryKey { type_name: String },
    #[error("\"{operation}\" is not supported on view \"{type_name}\"")]
    UnsupportedOnView {
        type_name: String,
        operation: String,
    },

    // Permissions
    #[error("permission denied")]
    PermissionDenied,
    #[error("field \"{type_name}.{field_name}\" conflicts with a role-assigned default")]
    PermissionConflict {
        type_name: String,
        field_name: String,
    },
    #[error("cannot bind permission placeholder \"{placeholder}\": {message}")]
    PermissionBind {
        placeholder: String,
        message: String,
    },

    // Compilation
    #[error("aggregation \"{function}\" is not supported for \"{type_name}\"")]
    UnsupportedAggregation {
        type_name: String,
        function: String,
    },
    #[error("cannot sort by \"{path}\": the aggregation is not selected in the projection")]
    SortByUnselected { path: String },

    // Execution
    #[error("execution failed: {message}")]
    Execution { message: String },
    #[error("upstream data source \"{source_name}\" failed: {message}")]
    Upstream {
        source_name: String,
        message: String,
    },
    #[error("cluster node \"{node}\" failed: {message}")]
    ClusterPeer { node: String, message: String },
    #[error("cache operation failed: {message}")]
    Cache { message: String },
    #[error("resource limit exceeded: {message}")]
    ResourceExhausted { message: String },
}

impl SingleHugrError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::ExecutionError,
            Self::InvalidGraphQlName(..) | Self::InvalidGraphQl { .. } => {
                ErrorCode::InvalidArgumentValue
            }
            Self::MissingEnvVariable { .. }
            | Self::InvalidConfiguration { .. }
            | Self::CatalogFetch { .. }
            | Self::CatalogParse { .. }
            | Self::CycleDetected { .. }
            | Self::UnknownDependency { .. }
            | Self::PrefixCollision { .. }
            | Self::DuplicateField { .. }
            | Self::DuplicateType { .. }
            | Self::UnsupportedDirective { .. }
            | Self::TypeNotResolvable { .. } => ErrorCode::SchemaError,
            Self::InvalidFieldName { .. }
            | Self::InvalidArgumentValue { .. }
            | Self::WrongOperator { .. }
            | Self::TypeMismatch { .. }
            | Self::MissingPrimaryKey { .. }
            | Self::UnsupportedOnView { .. }
            | Self::UnsupportedAggregation { .. }
            | Self::SortByUnselected { .. } => ErrorCode::InvalidArgumentValue,
            Self::DepthExceeded { .. } => ErrorCode::DepthExceeded,
            Self::PermissionDenied
            | Self::PermissionConflict { .. }
            | Self::PermissionBind { .. } => ErrorCode::PermissionDenied,
            Self::Execution { .. } => ErrorCode::ExecutionError,
            Self::Upstream { .. } | Self::ClusterPeer { .. } => ErrorCode::UpstreamError,
            Self::Cache { .. } => ErrorCode::CacheError,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Default)]
pub struct MultipleHugrErrors {
    pub errors: Vec<SingleHugrError>,
}

impl MultipleHugrErrors {
    pub fn push(&mut self, error: HugrError) {
        match error {
            HugrError::Single(error) => {
                self.errors.push(error);
            }
            HugrError::Multiple(errors) => {
                self.errors.extend(errors.errors);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Converts the accumulated errors into a `Result`: `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), HugrError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self
                .errors
                .into_iter()
                .next()
                .expect("just checked the length")
                .into()),
            _ => Err(HugrError::Multiple(self)),
        }
    }
}

impl Display for MultipleHugrErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl From<SingleHugrError> for MultipleHugrErrors {
    fn from(value: SingleHugrError) -> Self {
        Self {
            errors: vec![value],
        }
    }
}

impl FromIterator<SingleHugrError> for MultipleHugrErrors {
    fn from_iter<T: IntoIterator<Item = SingleHugrError>>(iter: T) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HugrError {
    #[error(transparent)]
    Single(#[from] SingleHugrError),
    #[error("{0}")]
    Multiple(MultipleHugrErrors),
}

impl From<MultipleHugrErrors> for HugrError {
    fn from(errors: MultipleHugrErrors) -> Self {
        match errors.errors.len() {
            1 => HugrError::Single(
                errors
                    .errors
                    .into_iter()
                    .next()
                    .expect("just checked the length"),
            ),
            _ => HugrError::Multiple(errors),
        }
    }
}

impl From<InvalidNameError> for HugrError {
    fn from(err: InvalidNameError) -> Self {
        SingleHugrError::from(err).into()
    }
}

impl From<DiagnosticList> for HugrError {
    fn from(value: DiagnosticList) -> Self {
        let errors: MultipleHugrErrors = value
            .iter()
            .map(|d| SingleHugrError::InvalidGraphQl {
                message: d.to_string(),
            })
            .collect();
        errors.into()
    }
}

impl<T> From<WithErrors<T>> for HugrError {
    fn from(value: WithErrors<T>) -> Self {
        value.errors.into()
    }
}

impl HugrError {
    pub fn internal(message: impl Into<String>) -> Self {
        SingleHugrError::Internal {
            message: message.into(),
        }
        .into()
    }

    pub fn execution(message: impl Into<String>) -> Self {
        SingleHugrError::Execution {
            message: message.into(),
        }
        .into()
    }

    /// The code of the first error; aggregates report the code of their first member.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Single(error) => error.code(),
            Self::Multiple(errors) => errors
                .errors
                .first()
                .map(SingleHugrError::code)
                .unwrap_or(ErrorCode::ExecutionError),
        }
    }

    pub fn errors(&self) -> Vec<&SingleHugrError> {
        match self {
            Self::Single(error) => vec![error],
            Self::Multiple(errors) => errors.errors.iter().collect(),
        }
    }

    pub fn merge(self, other: Self) -> Self {
        let mut errors = match self {
            Self::Single(error) => MultipleHugrErrors::from(error),
            Self::Multiple(errors) => errors,
        };
        errors.push(other);
        errors.into()
    }
}

/// Accumulates validation and compilation errors up to a bound instead of failing on the
/// first one. Errors past the bound are counted but not retained.
#[derive(Debug)]
pub struct ErrorSink {
    errors: MultipleHugrErrors,
    dropped: usize,
    limit: usize,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink {
    const DEFAULT_LIMIT: usize = 100;

    pub fn new() -> Self {
        Self::with_limit(Self::DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            errors: MultipleHugrErrors::default(),
            dropped: 0,
            limit,
        }
    }

    pub fn push(&mut self, error: SingleHugrError) {
        if self.errors.len() < self.limit {
            self.errors.errors.push(error);
        } else {
            self.dropped += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.dropped == 0
    }

    pub fn into_result(mut self) -> Result<(), HugrError> {
        if self.dropped > 0 {
            self.errors.errors.push(SingleHugrError::Internal {
                message: format!("{} further errors were not reported", self.dropped),
            });
        }
        self.errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_errors_display_one_per_line() {
        let errors: MultipleHugrErrors = [
            SingleHugrError::PermissionDenied,
            SingleHugrError::MissingPrimaryKey {
                type_name: "orders".to_owned(),
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(
            errors.to_string(),
            "permission denied\ntype \"orders\" has no primary key"
        );
    }

    #[test]
    fn single_error_collapses_aggregate() {
        let mut errors = MultipleHugrErrors::default();
        errors.push(SingleHugrError::PermissionDenied.into());
        let err: HugrError = errors.into();
        assert!(matches!(err, HugrError::Single(_)));
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn error_sink_caps_reported_errors() {
        let mut sink = ErrorSink::with_limit(2);
        for _ in 0..5 {
            sink.push(SingleHugrError::PermissionDenied);
        }
        let err = sink.into_result().expect_err("expected errors");
        assert_eq!(err.errors().len(), 3);
    }
}
