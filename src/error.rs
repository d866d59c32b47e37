use crate::acme;
use crate::acme::error::Error as AcmeError;
use std::fmt::{Debug, Formatter};

pub type IssueResult<T> = Result<T, IssueError>;

/// Classified failure of one issuance/renewal run. The classification feeds the
/// renewal history and decides nothing else; every variant wraps the full cause
/// chain.
pub enum IssueError {
    /// Something on our side failed (I/O, local resources, bugs).
    ClientFailure(anyhow::Error),
    /// The CA asked us to back off.
    RateLimited(anyhow::Error),
    /// The CA misbehaved or rejected the order.
    CAFailure(anyhow::Error),
    /// Ownership of at least one identifier could not be proven.
    AuthFailure(anyhow::Error),
    /// A bounded poll loop ran out of attempts. Deliberately distinct from
    /// "rejected by authority".
    TimedOut(anyhow::Error),
}

impl std::error::Error for IssueError {}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            IssueError::ClientFailure(err)
            | IssueError::RateLimited(err)
            | IssueError::CAFailure(err)
            | IssueError::AuthFailure(err)
            | IssueError::TimedOut(err) => std::fmt::Debug::fmt(err, f),
        }
    }
}

impl Debug for IssueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl IssueError {
    /// Flattened, human-readable messages of the whole cause chain, outermost first.
    pub fn messages(&self) -> Vec<String> {
        let err = match self {
            IssueError::ClientFailure(err)
            | IssueError::RateLimited(err)
            | IssueError::CAFailure(err)
            | IssueError::AuthFailure(err)
            | IssueError::TimedOut(err) => err,
        };
        err.chain().map(ToString::to_string).collect()
    }
}

impl From<anyhow::Error> for IssueError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AcmeError>() {
            Some(inner) => match inner {
                AcmeError::ProtocolViolation(_) | AcmeError::AcmeProblem(_) => {
                    IssueError::CAFailure(err)
                }
                AcmeError::IoError(_) | AcmeError::Http(_) => IssueError::ClientFailure(err),
                AcmeError::RateLimited(_) => IssueError::RateLimited(err),
                AcmeError::TimedOut(_) => IssueError::TimedOut(err),
            },
            None => IssueError::ClientFailure(err),
        }
    }
}

impl From<acme::error::Problem> for IssueError {
    fn from(err: acme::error::Problem) -> Self {
        if err.is_rate_limit() {
            IssueError::RateLimited(AcmeError::from(err).into())
        } else {
            IssueError::CAFailure(AcmeError::from(err).into())
        }
    }
}

pub trait IssueContext<T> {
    fn client_failure(self) -> IssueResult<T>;
    fn ca_failure(self) -> IssueResult<T>;
    fn authentication_failure(self) -> IssueResult<T>;
    fn timed_out(self) -> IssueResult<T>;
}

impl<T> IssueContext<T> for anyhow::Error {
    fn client_failure(self) -> IssueResult<T> {
        Err(IssueError::ClientFailure(self))
    }

    fn ca_failure(self) -> IssueResult<T> {
        Err(IssueError::CAFailure(self))
    }

    fn authentication_failure(self) -> IssueResult<T> {
        Err(IssueError::AuthFailure(self))
    }

    fn timed_out(self) -> IssueResult<T> {
        Err(IssueError::TimedOut(self))
    }
}

impl<T> IssueContext<T> for Result<T, anyhow::Error> {
    fn client_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.client_failure(),
        }
    }

    fn ca_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.ca_failure(),
        }
    }

    fn authentication_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.authentication_failure(),
        }
    }

    fn timed_out(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.timed_out(),
        }
    }
}
