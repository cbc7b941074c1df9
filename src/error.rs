use crate::state::ModelPhase;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a classification (or an administrative store operation) can fail.
///
/// The first four variants are the request-path failures; each one is terminal
/// for the request that raised it. "Not Determined" is not an error and never
/// shows up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to decode image: {0}")]
    Preprocess(#[from] image::ImageError),
    #[error("The embedding model is not ready (phase: {0})")]
    ModelNotReady(ModelPhase),
    #[error("Embedding extraction failed: {0}")]
    Extraction(String),
    #[error("The feature store is unavailable: {0}")]
    StoreUnavailable(String),
    #[error("The embedding model failed to load: {0}")]
    ModelLoad(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code, used by the HTTP layer and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Preprocess(_) => "PREPROCESS_ERROR",
            Error::ModelNotReady(_) => "MODEL_NOT_READY",
            Error::Extraction(_) => "EXTRACTION_ERROR",
            Error::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Error::ModelLoad(_) => "MODEL_LOAD_FAILED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::Extraction(e.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Extraction(e.to_string())
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

// A stored vector that no longer decodes means the corpus cannot be read as a whole.
impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::StoreUnavailable(format!("corrupt feature vector: {e}"))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
      S: serde::ser::Serializer,
    {
      serializer.serialize_str(self.to_string().as_ref())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn request_failures_have_distinct_kinds()
    {
        let kinds = [
            Error::ModelNotReady(ModelPhase::Loading).kind(),
            Error::Extraction("boom".into()).kind(),
            Error::StoreUnavailable("gone".into()).kind(),
            Error::Preprocess(image::ImageError::IoError(std::io::Error::other("bad"))).kind(),
        ];
        let mut deduped = kinds.to_vec();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), kinds.len());
    }

    #[test]
    fn serializes_as_display_string()
    {
        let err = Error::StoreUnavailable("disk is gone".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"The feature store is unavailable: disk is gone\"");
    }
}
