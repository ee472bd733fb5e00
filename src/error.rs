use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClawkerError {
    /// Bad user input caught before any daemon call
    #[error("{0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A daemon call returned an error
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Daemon or keychain could not be reached
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("volume {0} exists but is not managed by clawker; remove or rename it before retrying")]
    ForeignVolume(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    /// One layer of context naming the failing stage
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ClawkerError>,
    },

    #[error("container exited with status {code}")]
    Exit { code: i64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ClawkerError {
    /// Wrap this error with the name of the stage it escaped from
    pub fn in_stage(self, stage: &'static str) -> Self {
        ClawkerError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping stage wrappers
    pub fn root(&self) -> &ClawkerError {
        match self {
            ClawkerError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ClawkerError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ClawkerError::Cancelled)
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            ClawkerError::Exit { code } => i32::try_from(*code).unwrap_or(1),
            _ => 1,
        }
    }
}

impl From<bollard::errors::Error> for ClawkerError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BollardError;
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => ClawkerError::NotFound(message),
            BollardError::DockerContainerWaitError { code, .. } => ClawkerError::Exit { code },
            BollardError::IOError { err } => ClawkerError::Unavailable(format!(
                "cannot connect to the container runtime: {err}"
            )),
            BollardError::SocketNotFoundError(path) => ClawkerError::Unavailable(format!(
                "container runtime socket not found at {path}; is the Docker daemon running?"
            )),
            other => ClawkerError::Runtime(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClawkerError>;
