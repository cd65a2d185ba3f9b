//! TUS API Router
//!
//! Parses incoming requests under the mount prefix into TUS operations.

use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
}

/// TUS operation types
#[derive(Debug, Clone, PartialEq)]
pub enum TusOperation {
    /// OPTIONS {prefix} or {prefix}/{id}
    Discover,
    /// POST {prefix}
    Create,
    /// PATCH {prefix}/{id}
    Append { id: String },
    /// HEAD {prefix}/{id}
    Status { id: String },
    /// DELETE {prefix}/{id}
    Terminate { id: String },
}

/// TUS Request Parser
///
/// Paths outside the prefix yield `Ok(None)` so other routes can claim them.
pub struct TusRequestParser {
    prefix: String,
}

impl TusRequestParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Parse an HTTP request into a TUS operation
    pub fn parse(&self, method: &str, path: &str) -> Result<Option<TusOperation>, RouterError> {
        let rest = match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Ok(None),
        };

        let id = rest.trim_start_matches('/').trim_end_matches('/');

        if id.is_empty() {
            return match method {
                "OPTIONS" => Ok(Some(TusOperation::Discover)),
                "POST" => Ok(Some(TusOperation::Create)),
                _ => Err(RouterError::MethodNotAllowed(format!(
                    "{} not allowed on the upload collection",
                    method
                ))),
            };
        }

        if !Self::is_valid_id(id) {
            return Err(RouterError::InvalidPath(format!("Invalid upload id '{}'", id)));
        }

        let id = id.to_string();
        match method {
            "OPTIONS" => Ok(Some(TusOperation::Discover)),
            "PATCH" => Ok(Some(TusOperation::Append { id })),
            "HEAD" => Ok(Some(TusOperation::Status { id })),
            "DELETE" => Ok(Some(TusOperation::Terminate { id })),
            _ => Err(RouterError::MethodNotAllowed(format!(
                "{} not allowed on an upload",
                method
            ))),
        }
    }

    /// Upload ids are URL-safe tokens; anything else cannot name a file we created
    pub fn is_valid_id(id: &str) -> bool {
        id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> TusRequestParser {
        TusRequestParser::new("/files")
    }

    #[test]
    fn test_parse_create() {
        assert_eq!(parser().parse("POST", "/files").unwrap(), Some(TusOperation::Create));
        assert_eq!(parser().parse("POST", "/files/").unwrap(), Some(TusOperation::Create));
    }

    #[test]
    fn test_parse_resource_operations() {
        let p = parser();
        assert_eq!(
            p.parse("PATCH", "/files/abc123").unwrap(),
            Some(TusOperation::Append { id: "abc123".into() })
        );
        assert_eq!(
            p.parse("HEAD", "/files/abc123").unwrap(),
            Some(TusOperation::Status { id: "abc123".into() })
        );
        assert_eq!(
            p.parse("DELETE", "/files/abc123/").unwrap(),
            Some(TusOperation::Terminate { id: "abc123".into() })
        );
        assert_eq!(p.parse("OPTIONS", "/files/abc123").unwrap(), Some(TusOperation::Discover));
    }

    #[test]
    fn test_parse_outside_prefix() {
        assert_eq!(parser().parse("POST", "/health").unwrap(), None);
        assert_eq!(parser().parse("POST", "/files2").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(matches!(
            parser().parse("HEAD", "/files/../etc/passwd"),
            Err(RouterError::InvalidPath(_))
        ));
        assert!(matches!(
            parser().parse("HEAD", "/files/a/b"),
            Err(RouterError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parse_method_not_allowed() {
        assert!(matches!(
            parser().parse("GET", "/files/abc"),
            Err(RouterError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            parser().parse("PATCH", "/files"),
            Err(RouterError::MethodNotAllowed(_))
        ));
    }
}
