/// Return `Result<(), MainError>` from main functions so fatal errors are
/// logged once through tracing before the process exits non-zero.
pub struct MainError(anyhow::Error);

impl<T: Into<anyhow::Error>> From<T> for MainError {
    fn from(e: T) -> Self {
        let err: anyhow::Error = e.into();
        tracing::error!("{err:#}");
        Self(err)
    }
}

impl std::fmt::Debug for MainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Just print the `Display` of the error rather than `Debug`; the
        // tracing hook above already captured it with full context.
        write!(f, "{}", self.0)
    }
}
