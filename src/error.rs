//! Errors for the ambient parts of the crate: worker spawning and configuration.
//! Render outcomes are never errors; they are reported through `did_display`.

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config read failed: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse failed: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl RenderError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_names_thread() {
        let err = RenderError::Spawn {
            name: "async-layer.render-3".into(),
            source: std::io::Error::other("no threads left"),
        };
        let msg = err.to_string();
        assert!(msg.contains("async-layer.render-3"));
        assert!(msg.contains("no threads left"));
    }

    #[test]
    fn invalid_config_prefix_is_stable() {
        assert!(RenderError::invalid_config("x")
            .to_string()
            .starts_with("invalid config:"));
    }
}
