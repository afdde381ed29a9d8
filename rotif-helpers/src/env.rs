use std::env::{self, VarError};

/// A wrapper around variables provided by the current environment, so
/// config loading can be unit tested without touching the real process
/// environment.
pub trait EnvVars: Send + Sync {
    fn var(&self, key: &str) -> Result<String, VarError>;
    fn clone_env_vars(&self) -> Box<dyn EnvVars>;
}

/// Environment variables sourced from the current process.
#[derive(Default)]
pub struct ProcessEnvVars {}

impl ProcessEnvVars {
    pub fn new() -> Self {
        ProcessEnvVars {}
    }
}

impl EnvVars for ProcessEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }

    fn clone_env_vars(&self) -> Box<dyn EnvVars> {
        Box::new(ProcessEnvVars {})
    }
}

impl Clone for Box<dyn EnvVars> {
    fn clone(&self) -> Self {
        self.clone_env_vars()
    }
}
