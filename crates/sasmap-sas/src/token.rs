use std::fmt;

/// The provisioned SAS query-string fragment, without a leading `?`.
///
/// Opaque and URL-encoded; held in memory for the process lifetime and
/// appended verbatim to upstream paths. The full value authorizes reads
/// against the container and appears in the per-request rewrite log, the
/// same way the upstream URL would in any access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken(String);

impl SasToken {
    pub fn new(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
