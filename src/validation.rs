//! Input validation for user-supplied task and comment content.
use crate::SpiralError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_CONTENT_LENGTH: usize = 10_000;

static SAFE_CONTENT_REGEX: &str = r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
];

#[derive(Debug, Clone)]
pub struct ContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl ContentValidator {
    pub fn new() -> Result<Self, SpiralError> {
        let safe_content_regex = Regex::new(SAFE_CONTENT_REGEX)
            .map_err(|e| SpiralError::ConfigurationError(format!("invalid regex pattern: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();
        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    fn check_dangerous(&self, content: &str) -> Result<(), SpiralError> {
        let lower = content.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lower.contains(pattern.as_str()) {
                return Err(SpiralError::InvalidRequest("content contains a disallowed pattern".into()));
            }
        }
        Ok(())
    }

    pub fn validate_title(&self, title: &str) -> Result<String, SpiralError> {
        if title.trim().is_empty() {
            return Err(SpiralError::InvalidRequest("title cannot be empty".into()));
        }
        if title.len() > MAX_TITLE_LENGTH {
            return Err(SpiralError::InvalidRequest(format!(
                "title exceeds maximum length of {MAX_TITLE_LENGTH} characters"
            )));
        }
        self.check_dangerous(title)?;
        if !self.safe_content_regex.is_match(title) {
            return Err(SpiralError::InvalidRequest("title contains invalid characters".into()));
        }
        Ok(encode_text(title).to_string())
    }

    pub fn validate_content(&self, content: &str) -> Result<String, SpiralError> {
        if content.len() > MAX_CONTENT_LENGTH {
            return Err(SpiralError::InvalidRequest(format!(
                "content exceeds maximum length of {MAX_CONTENT_LENGTH} characters"
            )));
        }
        self.check_dangerous(content)?;
        if !content.trim().is_empty() && !self.safe_content_regex.is_match(content) {
            return Err(SpiralError::InvalidRequest("content contains invalid characters".into()));
        }
        Ok(encode_text(content).to_string())
    }
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new().expect("static regex pattern is valid")
    }
}

static VALIDATOR: OnceLock<ContentValidator> = OnceLock::new();

pub fn validator() -> &'static ContentValidator {
    VALIDATOR.get_or_init(ContentValidator::default)
}
