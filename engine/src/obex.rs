//! OBEX response codes used by BPP.
//!
//! Codes are the OBEX values without the final bit; the profile layer sets
//! that bit on the wire.

use std::fmt;

/// An OBEX response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    pub const CONTINUE: ResponseCode = ResponseCode(0x10);
    pub const OK: ResponseCode = ResponseCode(0x20);
    pub const CREATED: ResponseCode = ResponseCode(0x21);
    pub const ACCEPTED: ResponseCode = ResponseCode(0x22);
    pub const PARTIAL_CONTENT: ResponseCode = ResponseCode(0x26);
    pub const BAD_REQUEST: ResponseCode = ResponseCode(0x40);
    pub const UNAUTHORIZED: ResponseCode = ResponseCode(0x41);
    pub const FORBIDDEN: ResponseCode = ResponseCode(0x43);
    pub const NOT_FOUND: ResponseCode = ResponseCode(0x44);
    pub const METHOD_NOT_ALLOWED: ResponseCode = ResponseCode(0x45);
    pub const NOT_ACCEPTABLE: ResponseCode = ResponseCode(0x46);
    pub const REQUEST_TIMEOUT: ResponseCode = ResponseCode(0x48);
    pub const CONFLICT: ResponseCode = ResponseCode(0x49);
    pub const PRECONDITION_FAILED: ResponseCode = ResponseCode(0x4C);
    pub const UNSUPPORTED_MEDIA_TYPE: ResponseCode = ResponseCode(0x4F);
    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode(0x50);
    pub const NOT_IMPLEMENTED: ResponseCode = ResponseCode(0x51);
    pub const SERVICE_UNAVAILABLE: ResponseCode = ResponseCode(0x53);
    pub const DATABASE_FULL: ResponseCode = ResponseCode(0x60);
    pub const DATABASE_LOCKED: ResponseCode = ResponseCode(0x61);

    /// More segments follow this one.
    pub fn is_continue(&self) -> bool {
        *self == Self::CONTINUE
    }

    /// 2xx class.
    pub fn is_success(&self) -> bool {
        (0x20..0x30).contains(&self.0)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::CONTINUE => "Continue",
            Self::OK => "OK",
            Self::CREATED => "Created",
            Self::ACCEPTED => "Accepted",
            Self::PARTIAL_CONTENT => "Partial Content",
            Self::BAD_REQUEST => "Bad Request",
            Self::UNAUTHORIZED => "Unauthorized",
            Self::FORBIDDEN => "Forbidden",
            Self::NOT_FOUND => "Not Found",
            Self::METHOD_NOT_ALLOWED => "Method Not Allowed",
            Self::NOT_ACCEPTABLE => "Not Acceptable",
            Self::REQUEST_TIMEOUT => "Request Timeout",
            Self::CONFLICT => "Conflict",
            Self::PRECONDITION_FAILED => "Precondition Failed",
            Self::UNSUPPORTED_MEDIA_TYPE => "Unsupported Media Type",
            Self::INTERNAL_SERVER_ERROR => "Internal Server Error",
            Self::NOT_IMPLEMENTED => "Not Implemented",
            Self::SERVICE_UNAVAILABLE => "Service Unavailable",
            Self::DATABASE_FULL => "Database Full",
            Self::DATABASE_LOCKED => "Database Locked",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.0)
    }
}
