/// 协议配置 trait
pub trait ProtocolConfig:
    Send + Sync + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned + 'static
{
    /// 验证配置是否有效
    fn validate(&self) -> Result<(), ConfigError>;

    /// 获取默认配置
    fn default_config() -> Self;

    /// 从 JSON 文本加载并验证配置
    fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载并验证配置
    fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
                suggestion: "check the configuration path".to_string(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// 协议配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        address: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required field '{field}'\nSuggestion: {suggestion}")]
    MissingRequiredField { field: String, suggestion: String },

    #[error("Invalid value for '{field}': {value}\nReason: {reason}\nSuggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("File not found: '{path}'\nSuggestion: {suggestion}")]
    FileNotFound { path: String, suggestion: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn must_be_positive(field: &str, value: impl std::fmt::Display, suggestion: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be > 0".to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}
