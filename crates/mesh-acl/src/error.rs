use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("pattern must not be empty")]
    EmptyPattern,
    #[error("invalid glob pattern '{pattern}': {detail}")]
    InvalidGlob { pattern: String, detail: String },
    #[error("invalid regex pattern '{pattern}': {detail}")]
    InvalidRegex { pattern: String, detail: String },
    #[error("rule name must not be empty")]
    EmptyRuleName,
    #[error("duplicate rule name '{0}'")]
    DuplicateRule(String),
    #[error("allowed hours must fall within 0-23, got {start}-{end}")]
    InvalidHourRange { start: u8, end: u8 },
    #[error("allowed days must fall within 0-6 (0 = Sunday), got {0}")]
    InvalidDay(u8),
}
