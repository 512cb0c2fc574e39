use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("unknown mode '{0}' (expected send, receive or both)")]
    UnknownMode(String),

    #[error("domain error: {0}")]
    Domain(#[from] relq_domain::DomainError),
}
