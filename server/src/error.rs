use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("object not found")]
    NotFound,

    #[error("operation requires a role the caller does not hold")]
    Forbidden,

    #[error("unauthorized access")]
    Unauthorized,

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no addresses left to allocate in this network")]
    IpExhausted,

    #[error("join policy denied the request: {0}")]
    PolicyDenied(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("internal database error")]
    Database(#[from] rusqlite::Error),

    #[error("internal I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing/serialization error")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// The stable wire code for this error. Transport layers map these to
    /// status codes; the mapping is deterministic and one-to-one per code.
    pub fn code(&self) -> &'static str {
        use ServerError::*;
        match self {
            NotFound => "not_found",
            Forbidden => "forbidden",
            Unauthorized => "unauthorized",
            Validation(_) | Json(_) => "validation",
            Conflict(_) => "conflict",
            IpExhausted => "ip_exhausted",
            PolicyDenied(_) => "policy_denied",
            RateLimited => "rate_limited",
            // Special-case the constraint violation situation: a uniqueness
            // clash is a retryable conflict, not an internal fault.
            Database(rusqlite::Error::SqliteFailure(libsqlite3_sys::Error { code, .. }, ..))
                if *code == libsqlite3_sys::ErrorCode::ConstraintViolation =>
            {
                "conflict"
            },
            Database(rusqlite::Error::QueryReturnedNoRows) => "not_found",
            Internal(_) | Database(_) | Io(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping_is_stable() {
        assert_eq!(ServerError::NotFound.code(), "not_found");
        assert_eq!(ServerError::Forbidden.code(), "forbidden");
        assert_eq!(ServerError::IpExhausted.code(), "ip_exhausted");
        assert_eq!(
            ServerError::PolicyDenied("banned".into()).code(),
            "policy_denied"
        );
        assert_eq!(
            ServerError::Database(rusqlite::Error::QueryReturnedNoRows).code(),
            "not_found"
        );
    }
}
