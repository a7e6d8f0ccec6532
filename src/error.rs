use thiserror::Error;

pub type Result<T> = std::result::Result<T, PortfolioError>;

/// Failures raised by the allocation pipeline.
///
/// Each variant is reported by the component that first observes the problem;
/// nothing in the numeric core retries or coerces bad input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
    /// Malformed or insufficient price history.
    #[error("data error: {0}")]
    Data(String),

    /// Invalid market-cap, view, or model configuration.
    #[error("config error: {0}")]
    Config(String),

    /// No meaningful long-only allocation exists for the inputs.
    #[error("infeasible: {0}")]
    Infeasible(String),
}

impl PortfolioError {
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn infeasible(msg: impl Into<String>) -> Self {
        Self::Infeasible(msg.into())
    }

    /// Short label used in console output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "DataError",
            Self::Config(_) => "ConfigError",
            Self::Infeasible(_) => "InfeasibleError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(PortfolioError::data("x").kind(), "DataError");
        assert_eq!(PortfolioError::config("x").kind(), "ConfigError");
        assert_eq!(PortfolioError::infeasible("x").kind(), "InfeasibleError");
        assert_eq!(
            PortfolioError::config("missing BTC").to_string(),
            "config error: missing BTC"
        );
    }
}
