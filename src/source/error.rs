use snafu::{Location, Snafu};

pub type Result<T, E = SourceError> = ::std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    /// Every credential slot has spent its quota for the current cycle.
    #[snafu(display("quota exceeded: {message}"))]
    QuotaExceeded {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The resource does not exist or is no longer public.
    #[snafu(display("{resource} was not found"))]
    NotFound {
        resource: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("transient failure while fetching {resource}: {message}"))]
    Transient {
        resource: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The source answered, but the record is missing required fields or is not the expected kind.
    #[snafu(display("malformed record for {resource}: {message}"))]
    Malformed {
        resource: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The source refused the request for a reason retrying will not fix.
    #[snafu(display("request for {resource} was rejected with status {status}: {message}"))]
    Rejected {
        resource: String,
        status: u16,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, SourceError::QuotaExceeded { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }
}
