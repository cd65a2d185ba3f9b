//! TUS protocol vocabulary
//!
//! Header names, the supported protocol version and extensions, and small
//! parsing helpers shared by the request handler.
//! See <https://tus.io/protocols/resumable-upload> for the wire protocol.

pub mod metadata;

pub use metadata::{MetadataError, UploadMetadata};

use chrono::{DateTime, Utc};

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised via `Tus-Extension`
pub const TUS_EXTENSIONS: &str =
    "creation,creation-defer-length,creation-with-upload,termination,expiration";

/// Content type required on PATCH (and creation-with-upload) bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: &str = "Tus-Resumable";
pub const TUS_VERSION_HEADER: &str = "Tus-Version";
pub const TUS_EXTENSION: &str = "Tus-Extension";
pub const TUS_MAX_SIZE: &str = "Tus-Max-Size";
pub const UPLOAD_OFFSET: &str = "Upload-Offset";
pub const UPLOAD_LENGTH: &str = "Upload-Length";
pub const UPLOAD_DEFER_LENGTH: &str = "Upload-Defer-Length";
pub const UPLOAD_METADATA: &str = "Upload-Metadata";
pub const UPLOAD_EXPIRES: &str = "Upload-Expires";
pub const METHOD_OVERRIDE: &str = "X-HTTP-Method-Override";

/// Headers a browser client must be allowed to read
pub const EXPOSED_HEADERS: &str = "Location, Upload-Offset, Upload-Length, Upload-Metadata, \
     Upload-Defer-Length, Upload-Expires, Tus-Resumable, Tus-Version, Tus-Extension, Tus-Max-Size";

/// Headers a browser client may send
pub const ALLOWED_HEADERS: &str = "Authorization, Content-Type, Location, Tus-Extension, \
     Tus-Max-Size, Tus-Resumable, Tus-Version, Upload-Concat, Upload-Defer-Length, \
     Upload-Length, Upload-Metadata, Upload-Offset, X-HTTP-Method-Override, X-Requested-With";

pub const ALLOWED_METHODS: &str = "POST, HEAD, PATCH, OPTIONS, DELETE";

/// Methods `X-HTTP-Method-Override` may select
pub const TUS_METHODS: [&str; 5] = ["POST", "HEAD", "PATCH", "OPTIONS", "DELETE"];

/// Parse a non-negative byte count header (`Upload-Offset`, `Upload-Length`).
///
/// Only plain ASCII digits are accepted; signs and whitespace are rejected.
pub fn parse_byte_count(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Render a timestamp the way `Upload-Expires` requires (RFC 7231 HTTP-date)
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
