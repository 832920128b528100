use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("identity resolution: could not find the local node (port {port}) in cluster '{cluster}'")]
    SelfNotFound { cluster: String, port: u16 },

    #[error("identity resolution: no address in cluster '{cluster}' has identity hash '{hash}'")]
    InitiatorNotFound { cluster: String, hash: String },

    #[error("identity resolution: identity hash '{hash}' matches {count} addresses in cluster '{cluster}'")]
    AmbiguousInitiator {
        cluster: String,
        hash: String,
        count: usize,
    },

    #[error("query rewrite: {0}")]
    Rewrite(String),

    #[error("pull transport: {0}")]
    Transport(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("table function arguments: {0}")]
    Arguments(String),

    #[error("object read '{key}': {message}")]
    Object { key: String, message: String },

    #[error("task registry: no key sequence registered for query '{0}'")]
    UnknownQuery(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("datafusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

impl From<ClusterError> for DataFusionError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::DataFusion(e) => e,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

impl From<ClusterError> for Status {
    fn from(err: ClusterError) -> Self {
        match &err {
            ClusterError::UnknownQuery(_) => Status::not_found(err.to_string()),
            ClusterError::Arguments(_) | ClusterError::Json(_) => {
                Status::invalid_argument(err.to_string())
            }
            ClusterError::Cancelled => Status::cancelled(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}
