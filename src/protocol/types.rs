//! Wire Frame Types
//!
//! Every request and every response on the wire is one fixed-shape frame:
//!
//! ```text
//! ┌────────┬──────┬──────┬─────────────┬──────────────────┬─────────┬───────────┐
//! │ opcode │ arg1 │ arg2 │ secondary   │ primary_len      │ primary │ secondary │
//! │  (u8)  │ (u8) │ (u8) │ len (u8)    │ (u32, LE)        │  bytes  │  bytes    │
//! └────────┴──────┴──────┴─────────────┴──────────────────┴─────────┴───────────┘
//!   0        1      2      3             4..8               8..       ..
//! ```
//!
//! The 16-bit argument is `arg1 << 8 | arg2`. Opcodes with the high bit set
//! are "silent": the server never answers them, not even with an error.
//!
//! ## Payload Ownership
//!
//! A [`Command`] carries its body as a `Cow<[u8]>`. Commands parsed out of a
//! connection's receive buffer borrow from it (no copy at all); commands whose
//! body did not fit the buffer own a dedicated allocation. Converting a
//! command with [`Command::into_owned`] copies in the first case and moves in
//! the second.

use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use std::collections::TryReserveError;
use std::fmt;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Opcodes with this bit set never receive an answer.
pub const SILENT_MASK: u8 = 0x80;

/// Request and response opcodes.
pub mod opcode {
    /// Wildcard entry in a handler table.
    pub const DEFAULT: u8 = 0;

    pub const USE: u8 = 1;
    pub const DEBUG: u8 = 2;
    pub const TIMEOUT: u8 = 3;
    pub const QUIT: u8 = 4;

    pub const SEARCH_SET_DB: u8 = 32;
    pub const SEARCH_GET_DB: u8 = 33;

    pub const SEARCH_DB_TOTAL: u8 = 64;
    pub const SEARCH_GET_TOTAL: u8 = 65;
    pub const SEARCH_GET_RESULT: u8 = 66;
    pub const SEARCH_ADD_DB: u8 = 68;
    pub const SEARCH_FINISH: u8 = 69;
    pub const SEARCH_DRAW_TPOOL: u8 = 70;
    pub const SEARCH_ADD_LOG: u8 = 71;
    pub const SEARCH_GET_SYNONYMS: u8 = 72;
    pub const SEARCH_SCWS_GET: u8 = 73;

    pub const QUERY_GET_STRING: u8 = 96;
    pub const QUERY_GET_TERMS: u8 = 97;
    pub const QUERY_GET_CORRECTED: u8 = 98;
    pub const QUERY_GET_EXPANDED: u8 = 99;

    pub const OK: u8 = 128;
    pub const ERR: u8 = 129;
    pub const SEARCH_RESULT_DOC: u8 = 140;
    pub const SEARCH_RESULT_FIELD: u8 = 141;
    pub const SEARCH_RESULT_FACETS: u8 = 142;
    pub const SEARCH_RESULT_MATCHED: u8 = 143;

    pub const SEARCH_SET_SORT: u8 = 192;
    pub const SEARCH_SET_CUT: u8 = 193;
    pub const SEARCH_SET_NUMERIC: u8 = 194;
    pub const SEARCH_SET_COLLAPSE: u8 = 195;
    pub const SEARCH_KEEPALIVE: u8 = 196;
    pub const SEARCH_SET_FACETS: u8 = 197;
    pub const SEARCH_SCWS_SET: u8 = 198;
    pub const SEARCH_SET_CUTOFF: u8 = 199;
    pub const SEARCH_SET_MISC: u8 = 200;

    pub const QUERY_INIT: u8 = 224;
    pub const QUERY_PARSE: u8 = 225;
    pub const QUERY_TERM: u8 = 226;
    pub const QUERY_RANGEPROC: u8 = 227;
    pub const QUERY_RANGE: u8 = 228;
    pub const QUERY_VALCMP: u8 = 229;
    pub const QUERY_PREFIX: u8 = 230;
    pub const QUERY_PARSEFLAG: u8 = 231;
    pub const QUERY_TERMS: u8 = 232;

    /// Human-readable name, used by logs and the DEBUG dump.
    pub fn name(op: u8) -> &'static str {
        match op {
            USE => "USE",
            DEBUG => "DEBUG",
            TIMEOUT => "TIMEOUT",
            QUIT => "QUIT",
            SEARCH_SET_DB => "SEARCH_SET_DB",
            SEARCH_GET_DB => "SEARCH_GET_DB",
            SEARCH_DB_TOTAL => "SEARCH_DB_TOTAL",
            SEARCH_GET_TOTAL => "SEARCH_GET_TOTAL",
            SEARCH_GET_RESULT => "SEARCH_GET_RESULT",
            SEARCH_ADD_DB => "SEARCH_ADD_DB",
            SEARCH_FINISH => "SEARCH_FINISH",
            SEARCH_DRAW_TPOOL => "SEARCH_DRAW_TPOOL",
            SEARCH_ADD_LOG => "SEARCH_ADD_LOG",
            SEARCH_GET_SYNONYMS => "SEARCH_GET_SYNONYMS",
            SEARCH_SCWS_GET => "SEARCH_SCWS_GET",
            QUERY_GET_STRING => "QUERY_GET_STRING",
            QUERY_GET_TERMS => "QUERY_GET_TERMS",
            QUERY_GET_CORRECTED => "QUERY_GET_CORRECTED",
            QUERY_GET_EXPANDED => "QUERY_GET_EXPANDED",
            OK => "OK",
            ERR => "ERR",
            SEARCH_RESULT_DOC => "SEARCH_RESULT_DOC",
            SEARCH_RESULT_FIELD => "SEARCH_RESULT_FIELD",
            SEARCH_RESULT_FACETS => "SEARCH_RESULT_FACETS",
            SEARCH_RESULT_MATCHED => "SEARCH_RESULT_MATCHED",
            SEARCH_SET_SORT => "SEARCH_SET_SORT",
            SEARCH_SET_CUT => "SEARCH_SET_CUT",
            SEARCH_SET_NUMERIC => "SEARCH_SET_NUMERIC",
            SEARCH_SET_COLLAPSE => "SEARCH_SET_COLLAPSE",
            SEARCH_KEEPALIVE => "SEARCH_KEEPALIVE",
            SEARCH_SET_FACETS => "SEARCH_SET_FACETS",
            SEARCH_SCWS_SET => "SEARCH_SCWS_SET",
            SEARCH_SET_CUTOFF => "SEARCH_SET_CUTOFF",
            SEARCH_SET_MISC => "SEARCH_SET_MISC",
            QUERY_INIT => "QUERY_INIT",
            QUERY_PARSE => "QUERY_PARSE",
            QUERY_TERM => "QUERY_TERM",
            QUERY_RANGEPROC => "QUERY_RANGEPROC",
            QUERY_RANGE => "QUERY_RANGE",
            QUERY_VALCMP => "QUERY_VALCMP",
            QUERY_PREFIX => "QUERY_PREFIX",
            QUERY_PARSEFLAG => "QUERY_PARSEFLAG",
            QUERY_TERMS => "QUERY_TERMS",
            _ => "UNKNOWN",
        }
    }
}

/// Status codes carried in the argument of an `OK` response.
pub mod ok {
    pub const INFO: u16 = 200;
    pub const PROJECT: u16 = 201;
    pub const QUERY_STRING: u16 = 202;
    pub const DB_TOTAL: u16 = 203;
    pub const QUERY_TERMS: u16 = 204;
    pub const QUERY_CORRECTED: u16 = 205;
    pub const SEARCH_TOTAL: u16 = 206;
    pub const RESULT_BEGIN: u16 = SEARCH_TOTAL;
    pub const RESULT_END: u16 = 207;
    pub const TIMEOUT_SET: u16 = 208;
    pub const FINISHED: u16 = 209;
    pub const LOGGED: u16 = 210;
    pub const DB_CHANGED: u16 = 251;
    pub const DB_INFO: u16 = 252;
}

/// Status codes carried in the argument of an `ERR` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    NoProject = 401,
    TooLong = 402,
    InvalidChar = 403,
    Empty = 404,
    NoAction = 405,
    WrongPlace = 450,
    WrongFormat = 451,
    EmptyQuery = 452,
    Timeout = 501,
    IoError = 502,
    NoMemory = 503,
    Busy = 504,
    Unimplemented = 505,
    NoDb = 506,
    CreateHome = 508,
    InvalidHome = 509,
    TaskCanceled = 514,
    Backend = 515,
    Unknown = 600,
}

impl ErrorCode {
    /// Numeric status code as sent on the wire.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Default message sent with the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NoProject => "Project name not specified",
            ErrorCode::TooLong => "Data/Name too long",
            ErrorCode::InvalidChar => "Data/Name contains invalid characters",
            ErrorCode::Empty => "Data/Name empty",
            ErrorCode::NoAction => "No action until timeout",
            ErrorCode::WrongPlace => "Use the command in the wrong place",
            ErrorCode::WrongFormat => "Command format is incorrect",
            ErrorCode::EmptyQuery => "Empty query",
            ErrorCode::Timeout => "IO timeout",
            ErrorCode::IoError => "IO error",
            ErrorCode::NoMemory => "Out of memory",
            ErrorCode::Busy => "Server is too busy",
            ErrorCode::Unimplemented => "Command not implemented",
            ErrorCode::NoDb => "None of database avaiable",
            ErrorCode::CreateHome => "Failed to create home directoy of the project",
            ErrorCode::InvalidHome => "Invalid home directory of the project",
            ErrorCode::TaskCanceled => "Task is canceled due to timeout/error",
            ErrorCode::Backend => "Backend error",
            ErrorCode::Unknown => "Unknown internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.message())
    }
}

/// The fixed eight-byte frame header, decoded and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u8,
    pub arg1: u8,
    pub arg2: u8,
    pub secondary_len: u8,
    pub primary_len: u32,
}

impl Header {
    /// Builds a header for the given opcode and 16-bit argument.
    pub fn new(opcode: u8, arg: u16, primary_len: u32, secondary_len: u8) -> Self {
        Self {
            opcode,
            arg1: (arg >> 8) as u8,
            arg2: (arg & 0xff) as u8,
            secondary_len,
            primary_len,
        }
    }

    /// Reads a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Returns `None` if fewer than [`HEADER_LEN`] bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            opcode: buf[0],
            arg1: buf[1],
            arg2: buf[2],
            secondary_len: buf[3],
            primary_len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Appends the encoded header to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.opcode);
        dst.put_u8(self.arg1);
        dst.put_u8(self.arg2);
        dst.put_u8(self.secondary_len);
        dst.put_u32_le(self.primary_len);
    }

    /// The combined 16-bit argument.
    pub fn arg(&self) -> u16 {
        u16::from(self.arg1) << 8 | u16::from(self.arg2)
    }

    /// Length of primary plus secondary payload.
    pub fn body_len(&self) -> usize {
        self.primary_len as usize + self.secondary_len as usize
    }

    /// Total size of the frame on the wire.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    /// Whether this opcode must never be answered.
    pub fn is_silent(&self) -> bool {
        self.opcode & SILENT_MASK != 0
    }
}

/// One decoded frame: header plus body (`primary` followed by `secondary`).
#[derive(Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub header: Header,
    body: Cow<'a, [u8]>,
}

impl<'a> Command<'a> {
    /// Wraps a body slice that lives in a receive buffer.
    ///
    /// `body` must be exactly `header.body_len()` bytes.
    pub fn borrowed(header: Header, body: &'a [u8]) -> Self {
        debug_assert_eq!(body.len(), header.body_len());
        Self {
            header,
            body: Cow::Borrowed(body),
        }
    }

    /// Wraps an owned body (a spillover allocation or a saved copy).
    pub fn owned(header: Header, body: Vec<u8>) -> Command<'static> {
        debug_assert_eq!(body.len(), header.body_len());
        Command {
            header,
            body: Cow::Owned(body),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    pub fn arg(&self) -> u16 {
        self.header.arg()
    }

    pub fn arg1(&self) -> u8 {
        self.header.arg1
    }

    pub fn arg2(&self) -> u8 {
        self.header.arg2
    }

    pub fn is_silent(&self) -> bool {
        self.header.is_silent()
    }

    /// True when the body is a view into a receive buffer.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.body, Cow::Borrowed(_))
    }

    /// The primary payload.
    pub fn primary(&self) -> &[u8] {
        &self.body[..self.header.primary_len as usize]
    }

    /// The secondary payload.
    pub fn secondary(&self) -> &[u8] {
        &self.body[self.header.primary_len as usize..]
    }

    /// The primary payload decoded lossily as UTF-8.
    pub fn primary_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.primary())
    }

    /// Detaches the command from the receive buffer.
    ///
    /// A borrowed body is copied into a fresh allocation; an owned body is
    /// moved. Allocation failure is reported instead of aborting.
    pub fn into_owned(self) -> Result<Command<'static>, TryReserveError> {
        let body = match self.body {
            Cow::Owned(body) => body,
            Cow::Borrowed(slice) => {
                let mut body = Vec::new();
                body.try_reserve_exact(slice.len())?;
                body.extend_from_slice(slice);
                body
            }
        };
        Ok(Command::owned(self.header, body))
    }

    /// Appends the complete frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.header.frame_len());
        self.header.encode(dst);
        dst.put_slice(&self.body);
    }
}

impl Command<'static> {
    /// Builds a frame with a primary payload only.
    pub fn new(opcode: u8, arg: u16, primary: impl Into<Vec<u8>>) -> Self {
        let body = primary.into();
        let header = Header::new(opcode, arg, body.len() as u32, 0);
        Command::owned(header, body)
    }

    /// Builds a frame with no payload.
    pub fn empty(opcode: u8, arg: u16) -> Self {
        Command::owned(Header::new(opcode, arg, 0, 0), Vec::new())
    }

    /// Builds a frame with both payloads. The secondary payload is truncated
    /// to 255 bytes, the most its length field can describe.
    pub fn with_secondary(opcode: u8, arg: u16, primary: &[u8], secondary: &[u8]) -> Self {
        let secondary = &secondary[..secondary.len().min(u8::MAX as usize)];
        let mut body = Vec::with_capacity(primary.len() + secondary.len());
        body.extend_from_slice(primary);
        body.extend_from_slice(secondary);
        let header = Header::new(opcode, arg, primary.len() as u32, secondary.len() as u8);
        Command::owned(header, body)
    }

    /// An `OK` response with the given status code and payload.
    pub fn ok(code: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(opcode::OK, code, payload)
    }

    /// An `ERR` response carrying the code's default message.
    pub fn err(code: ErrorCode) -> Self {
        Self::new(opcode::ERR, code.code(), code.message())
    }

    /// An `ERR` response with a custom message.
    pub fn err_with(code: ErrorCode, message: impl Into<Vec<u8>>) -> Self {
        Self::new(opcode::ERR, code.code(), message)
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &opcode::name(self.header.opcode))
            .field("arg", &self.header.arg())
            .field("primary_len", &self.header.primary_len)
            .field("secondary_len", &self.header.secondary_len)
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header::new(opcode::USE, 0x0102, 5, 3);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(&buf[..], &[1, 0x01, 0x02, 3, 5, 0, 0, 0]);
        assert_eq!(Header::decode(&buf), Some(header));
        assert_eq!(header.arg(), 0x0102);
        assert_eq!(header.frame_len(), HEADER_LEN + 8);
    }

    #[test]
    fn test_header_needs_eight_bytes() {
        assert_eq!(Header::decode(&[1, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_primary_and_secondary_split() {
        let cmd = Command::with_secondary(opcode::USE, 0, b"demo", b"/tmp/demo");
        assert_eq!(cmd.primary(), b"demo");
        assert_eq!(cmd.secondary(), b"/tmp/demo");

        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        let header = Header::decode(&buf).unwrap();
        let parsed = Command::borrowed(header, &buf[HEADER_LEN..]);
        assert_eq!(parsed.primary(), b"demo");
        assert_eq!(parsed.secondary(), b"/tmp/demo");
    }

    #[test]
    fn test_silent_opcodes() {
        assert!(Command::empty(opcode::SEARCH_SET_SORT, 0).is_silent());
        assert!(Command::empty(opcode::QUERY_TERM, 0).is_silent());
        assert!(!Command::empty(opcode::SEARCH_GET_RESULT, 0).is_silent());
    }

    #[test]
    fn test_into_owned_copies_borrowed_body() {
        let raw = b"hello".to_vec();
        let header = Header::new(opcode::QUERY_PARSE, 0, 5, 0);
        let cmd = Command::borrowed(header, &raw);
        assert!(cmd.is_borrowed());

        let owned = cmd.into_owned().unwrap();
        drop(raw);
        assert!(!owned.is_borrowed());
        assert_eq!(owned.primary(), b"hello");
    }

    #[test]
    fn test_error_frame() {
        let cmd = Command::err(ErrorCode::NoProject);
        assert_eq!(cmd.opcode(), opcode::ERR);
        assert_eq!(cmd.arg(), 401);
        assert_eq!(cmd.primary(), b"Project name not specified");
    }
}
