//! API Router
//!
//! Parses (method, path) into a typed [`ApiRoute`]. Path segments are
//! percent-decoded.

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("No route for {0}")]
    NotFound(String),

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// API operations
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRoute {
    /// GET /health
    Health,
    /// GET /metrics
    Metrics,
    /// GET /api/events
    ListEvents,
    /// POST /api/events
    CreateEvent,
    /// GET /api/events/{id}
    GetEvent { event_id: String },
    /// POST /api/events/{id}/upload
    Upload { event_id: String },
    /// GET /api/events/{id}/download
    Download { event_id: String },
    /// GET /media/{key}
    Media { key: String },
}

/// API Request Parser
pub struct ApiRequestParser;

impl ApiRequestParser {
    /// Parse an HTTP request line into a route
    pub fn parse(method: &str, path: &str) -> Result<ApiRoute, RouterError> {
        let trimmed = path.trim_end_matches('/');
        let segments: Vec<&str> = trimmed.trim_start_matches('/').split('/').collect();

        let route = match segments.as_slice() {
            ["health"] => Self::only(method, "GET", path, ApiRoute::Health)?,
            ["metrics"] => Self::only(method, "GET", path, ApiRoute::Metrics)?,
            ["api", "events"] => match method {
                "GET" => ApiRoute::ListEvents,
                "POST" => ApiRoute::CreateEvent,
                _ => return Err(Self::not_allowed(method, path)),
            },
            ["api", "events", id] => Self::only(
                method,
                "GET",
                path,
                ApiRoute::GetEvent {
                    event_id: Self::decode(id)?,
                },
            )?,
            ["api", "events", id, "upload"] => Self::only(
                method,
                "POST",
                path,
                ApiRoute::Upload {
                    event_id: Self::decode(id)?,
                },
            )?,
            ["api", "events", id, "download"] => Self::only(
                method,
                "GET",
                path,
                ApiRoute::Download {
                    event_id: Self::decode(id)?,
                },
            )?,
            ["media", rest @ ..] if !rest.is_empty() => {
                let key = rest
                    .iter()
                    .map(|s| Self::decode(s))
                    .collect::<Result<Vec<_>, _>>()?
                    .join("/");
                Self::only(method, "GET", path, ApiRoute::Media { key })?
            }
            _ => return Err(RouterError::NotFound(path.to_string())),
        };
        Ok(route)
    }

    fn only(
        method: &str,
        allowed: &str,
        path: &str,
        route: ApiRoute,
    ) -> Result<ApiRoute, RouterError> {
        if method == allowed || (allowed == "GET" && method == "HEAD") {
            Ok(route)
        } else {
            Err(Self::not_allowed(method, path))
        }
    }

    fn not_allowed(method: &str, path: &str) -> RouterError {
        RouterError::MethodNotAllowed {
            method: method.to_string(),
            path: path.to_string(),
        }
    }

    fn decode(segment: &str) -> Result<String, RouterError> {
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| RouterError::InvalidPath(segment.to_string()))?;
        if decoded.is_empty() || decoded.contains('/') {
            return Err(RouterError::InvalidPath(segment.to_string()));
        }
        Ok(decoded.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        assert_eq!(
            ApiRequestParser::parse("GET", "/api/events").unwrap(),
            ApiRoute::ListEvents
        );
        assert_eq!(
            ApiRequestParser::parse("POST", "/api/events/").unwrap(),
            ApiRoute::CreateEvent
        );
        assert_eq!(
            ApiRequestParser::parse("GET", "/api/events/abc").unwrap(),
            ApiRoute::GetEvent {
                event_id: "abc".into()
            }
        );
    }

    #[test]
    fn test_parse_upload_and_download() {
        assert_eq!(
            ApiRequestParser::parse("POST", "/api/events/e%201/upload").unwrap(),
            ApiRoute::Upload {
                event_id: "e 1".into()
            }
        );
        assert_eq!(
            ApiRequestParser::parse("GET", "/api/events/e1/download").unwrap(),
            ApiRoute::Download {
                event_id: "e1".into()
            }
        );
    }

    #[test]
    fn test_parse_media_key() {
        assert_eq!(
            ApiRequestParser::parse("GET", "/media/events/e1/a.jpg").unwrap(),
            ApiRoute::Media {
                key: "events/e1/a.jpg".into()
            }
        );
    }

    #[test]
    fn test_method_not_allowed() {
        assert!(matches!(
            ApiRequestParser::parse("GET", "/api/events/e1/upload"),
            Err(RouterError::MethodNotAllowed { .. })
        ));
        assert!(matches!(
            ApiRequestParser::parse("DELETE", "/api/events"),
            Err(RouterError::MethodNotAllowed { .. })
        ));
    }

    #[test]
    fn test_unknown_and_invalid_paths() {
        assert!(matches!(
            ApiRequestParser::parse("GET", "/nope"),
            Err(RouterError::NotFound(_))
        ));
        assert!(matches!(
            ApiRequestParser::parse("GET", "/api/events/a%2Fb"),
            Err(RouterError::InvalidPath(_))
        ));
    }
}
