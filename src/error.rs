//! Error types and the portable error-code space
//!
//! `ErrorCode` is what crosses the wire: small internal codes below 50,
//! then one code per errno name in alphabetical order starting at 50.
//! Native errno values are translated where the failure happens, so a
//! client never needs to know the server's OS.

use std::fmt;
use std::io;

use crate::protocol::DecodeError;

/// Longest error message carried in a response, excluding the terminator.
pub const MAX_ERROR_MESSAGE: usize = 383;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem or application failure with a portable code.
    #[error("{message}")]
    Op {
        code: ErrorCode,
        message: String,
        /// The peer no longer trusts the connection; it must be torn down.
        force_shutdown: bool,
    },

    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("remote hangs up")]
    HangUp,

    #[error("remote does not implement this action")]
    NotImplemented,

    /// Permanent failure returned by an erroring backend.
    #[error("{0}")]
    Unavailable(String),

    #[error("invalid ip address {0}")]
    InvalidAddress(String),

    #[error("invalid ip range {0}")]
    InvalidRange(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn op(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Op {
            code,
            message: message.into(),
            force_shutdown: false,
        }
    }

    /// Translate a native filesystem failure, keeping the OS message.
    pub fn fs(err: &io::Error) -> Self {
        Error::Op {
            code: ErrorCode::from_io(err),
            message: os_message(err),
            force_shutdown: false,
        }
    }

    /// Same error, flagged so the peer drops the connection.
    pub fn with_shutdown(self) -> Self {
        match self {
            Error::Op { code, message, .. } => Error::Op {
                code,
                message,
                force_shutdown: true,
            },
            other => Error::Op {
                code: other.code(),
                message: other.to_string(),
                force_shutdown: true,
            },
        }
    }

    /// Portable code for any error, whatever its origin.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Op { code, .. } => *code,
            Error::Io(e) => ErrorCode::from_io(e),
            Error::Timeout(_) => ErrorCode::ETIMEDOUT,
            Error::HangUp => ErrorCode::ECONNRESET,
            Error::NotImplemented => ErrorCode::UNIMPLEMENTED_FUNCTION,
            Error::Decode(_)
            | Error::Protocol(_)
            | Error::Unavailable(_)
            | Error::InvalidAddress(_)
            | Error::InvalidRange(_) => ErrorCode::OTHER_ERROR,
        }
    }

    pub fn force_shutdown(&self) -> bool {
        matches!(
            self,
            Error::Op {
                force_shutdown: true,
                ..
            }
        )
    }

    /// Message bounded to what a response can carry.
    pub fn wire_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

/// Cut a message to `MAX_ERROR_MESSAGE` bytes on a char boundary.
pub fn truncate_message(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_MESSAGE {
        return msg.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

/// strerror-style text without the " (os error N)" suffix std appends.
fn os_message(err: &io::Error) -> String {
    let text = err.to_string();
    match text.rfind(" (os error ") {
        Some(pos) if err.raw_os_error().is_some() => text[..pos].to_string(),
        _ => text,
    }
}

/// Portable numeric error code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u64);

/// Errno names in wire order; index 0 is code 50.
const ERRNO_NAMES: &[&str] = &[
    "E2BIG", "EACCES", "EADDRINUSE", "EADDRNOTAVAIL", "EADV", "EAFNOSUPPORT", "EAGAIN",
    "EALREADY", "EAUTH", "EBADE", "EBADF", "EBADFD", "EBADMSG", "EBADR", "EBADRPC", "EBADRQC",
    "EBADSLT", "EBFONT", "EBUSY", "ECANCELED", "ECAPMODE", "ECHILD", "ECHRNG", "ECOMM",
    "ECONNABORTED", "ECONNREFUSED", "ECONNRESET", "EDEADLK", "EDESTADDRREQ", "EDOM", "EDOOFUS",
    "EDOTDOT", "EDQUOT", "EEXIST", "EFAULT", "EFBIG", "EFTYPE", "EHOSTDOWN", "EHOSTUNREACH",
    "EHWPOISON", "EIDRM", "EILSEQ", "EINPROGRESS", "EINTR", "EINVAL", "EIO", "EISCONN", "EISDIR",
    "EISNAM", "EKEYEXPIRED", "EKEYREJECTED", "EKEYREVOKED", "EL2HLT", "EL2NSYNC", "EL3HLT",
    "ELAST", "ELIBACC", "ELIBBAD", "ELIBEXEC", "ELIBMAX", "ELIBSCN", "ELNRNG", "ELOOP",
    "EMEDIUMTYPE", "EMFILE", "EMGSIZE", "EMLINK", "EMSGSIZE", "EMULTIHOP", "ENAMETOOLONG",
    "ENAVAIL", "ENEEDAUTH", "ENETDOWN", "ENETRESET", "ENETUNREACH", "ENFILE", "ENOANO",
    "ENOATTR", "ENOBUFS", "ENOCSI", "ENODATA", "ENODEV", "ENOENT", "ENOEXEC", "ENOKEY", "ENOLCK",
    "ENOLINK", "ENOMEDIUM", "ENOMEM", "ENOMSG", "ENONET", "ENOPKG", "ENOPROTOOPT", "ENOSPC",
    "ENOSR", "ENOSTR", "ENOSYM", "ENOSYS", "ENOTBLK", "ENOTCAPABLE", "ENOTCONN", "ENOTDIR",
    "ENOTEMPTY", "ENOTNAM", "ENOTRECOVERABLE", "ENOTSOCK", "ENOTSUP", "ENOTTY", "ENOTUNIQ",
    "ENXIO", "EOVERFLOW", "EOWNERDEAD", "EPERM", "EPFNOSUPPORT", "EPIPE", "EPROCLIM",
    "EPROCUNAVAIL", "EPROGMISMATCH", "EPROGUNAVAIL", "EPROTO", "EPROTONOSUPPORT", "EPROTOTYPE",
    "ERANGE", "EREMCHG", "EREMOTE", "EREMOTEIO", "ERESTART", "ERFKILL", "EROFS",
    "ERPCMISMATCH", "ESHUTDOWN", "ESOCKTNOSUPPORT", "ESPIPE", "ESRCH", "ESRMNT", "ESTALE",
    "ESTART", "ESTRPIPE", "ETIME", "ETIMEDOUT", "ETOOMANYREFS", "ETXTBSY", "EUCLEAN", "EUNATCH",
    "EUSERS", "EXDEV", "EXFULL", "STRUNCATE", "MSWIN_ERROR_INVALID_FUNCTION",
    "MSWIN_ERROR_FILE_NOT_FOUND", "MSWIN_ERROR_PATH_NOT_FOUND", "MSWIN_ERROR_TOO_MANY_OPEN_FILES",
    "MSWIN_ERROR_ACCESS_DENIED", "MSWIN_ERROR_INVALID_HANDLE",
];

const FIRST_ERRNO_CODE: u64 = 50;

const INTERNAL_DESCRIPTIONS: [&str; 13] = [
    "success",
    "unix error without translation",
    "mswin error without translation",
    "unimplemented function",
    "bad version",
    "server closed idle client",
    "early terminate from write",
    "other error",
    "endoffile",
    "pathname too long",
    "non-crypto op attempted",
    "server closed shell died",
    "last internal error",
];

impl ErrorCode {
    pub const SUCCESS: Self = Self(0);
    pub const UNIX_ERROR_WITHOUT_TRANSLATION: Self = Self(1);
    pub const MSWIN_ERROR_WITHOUT_TRANSLATION: Self = Self(2);
    pub const UNIMPLEMENTED_FUNCTION: Self = Self(3);
    pub const BAD_VERSION: Self = Self(4);
    pub const SERVER_CLOSED_IDLE_CLIENT: Self = Self(5);
    pub const EARLY_TERMINATE_FROM_WRITE_FILE: Self = Self(6);
    pub const OTHER_ERROR: Self = Self(7);
    pub const ENDOFFILE: Self = Self(8);
    pub const PATHNAME_TOO_LONG: Self = Self(9);
    pub const NON_CRYPTO_OP_ATTEMPTED: Self = Self(10);
    pub const SERVER_CLOSED_SHELL_DIED: Self = Self(11);
    pub const LAST_INTERNAL_ERROR: Self = Self(12);

    pub const EACCES: Self = Self(51);
    pub const ECONNRESET: Self = Self(76);
    pub const EEXIST: Self = Self(83);
    pub const EIO: Self = Self(95);
    pub const EISDIR: Self = Self(97);
    pub const ENAMETOOLONG: Self = Self(119);
    pub const ENOENT: Self = Self(132);
    pub const ENOSPC: Self = Self(143);
    pub const ENOTDIR: Self = Self(151);
    pub const EPERM: Self = Self(162);
    pub const ETIMEDOUT: Self = Self(189);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Errno-style name, if this code is in the errno range.
    pub fn name(self) -> Option<&'static str> {
        let idx = self.0.checked_sub(FIRST_ERRNO_CODE)?;
        ERRNO_NAMES.get(idx as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ERRNO_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| Self(FIRST_ERRNO_CODE + i as u64))
    }

    /// Human description of an internal code, as sent in acks.
    pub fn describe(self) -> &'static str {
        if self.0 < INTERNAL_DESCRIPTIONS.len() as u64 {
            INTERNAL_DESCRIPTIONS[self.0 as usize]
        } else if let Some(name) = self.name() {
            name
        } else {
            "remote returned invalid error"
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        errno_name(errno)
            .and_then(Self::from_name)
            .unwrap_or(Self::UNIX_ERROR_WITHOUT_TRANSLATION)
    }

    pub fn from_io(err: &io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::ENOENT,
            io::ErrorKind::PermissionDenied => Self::EACCES,
            io::ErrorKind::AlreadyExists => Self::EEXIST,
            io::ErrorKind::TimedOut => Self::ETIMEDOUT,
            io::ErrorKind::ConnectionReset => Self::ECONNRESET,
            io::ErrorKind::UnexpectedEof => Self::ENDOFFILE,
            _ => Self::OTHER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{} ({})", self.describe(), self.0),
        }
    }
}

fn errno_name(errno: i32) -> Option<&'static str> {
    let name = match errno {
        libc::E2BIG => "E2BIG",
        libc::EACCES => "EACCES",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::EAFNOSUPPORT => "EAFNOSUPPORT",
        libc::EAGAIN => "EAGAIN",
        libc::EALREADY => "EALREADY",
        libc::EBADF => "EBADF",
        libc::EBADMSG => "EBADMSG",
        libc::EBUSY => "EBUSY",
        libc::ECANCELED => "ECANCELED",
        libc::ECHILD => "ECHILD",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EDEADLK => "EDEADLK",
        libc::EDESTADDRREQ => "EDESTADDRREQ",
        libc::EDOM => "EDOM",
        libc::EDQUOT => "EDQUOT",
        libc::EEXIST => "EEXIST",
        libc::EFAULT => "EFAULT",
        libc::EFBIG => "EFBIG",
        libc::EHOSTDOWN => "EHOSTDOWN",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EIDRM => "EIDRM",
        libc::EILSEQ => "EILSEQ",
        libc::EINPROGRESS => "EINPROGRESS",
        libc::EINTR => "EINTR",
        libc::EINVAL => "EINVAL",
        libc::EIO => "EIO",
        libc::EISCONN => "EISCONN",
        libc::EISDIR => "EISDIR",
        libc::ELOOP => "ELOOP",
        libc::EMFILE => "EMFILE",
        libc::EMLINK => "EMLINK",
        libc::EMSGSIZE => "EMSGSIZE",
        libc::EMULTIHOP => "EMULTIHOP",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETRESET => "ENETRESET",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ENFILE => "ENFILE",
        libc::ENOBUFS => "ENOBUFS",
        libc::ENODEV => "ENODEV",
        libc::ENOENT => "ENOENT",
        libc::ENOEXEC => "ENOEXEC",
        libc::ENOLCK => "ENOLCK",
        libc::ENOLINK => "ENOLINK",
        libc::ENOMEM => "ENOMEM",
        libc::ENOMSG => "ENOMSG",
        libc::ENOPROTOOPT => "ENOPROTOOPT",
        libc::ENOSPC => "ENOSPC",
        libc::ENOSYS => "ENOSYS",
        libc::ENOTBLK => "ENOTBLK",
        libc::ENOTCONN => "ENOTCONN",
        libc::ENOTDIR => "ENOTDIR",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::ENOTRECOVERABLE => "ENOTRECOVERABLE",
        libc::ENOTSOCK => "ENOTSOCK",
        libc::ENOTSUP => "ENOTSUP",
        libc::ENOTTY => "ENOTTY",
        libc::ENXIO => "ENXIO",
        libc::EOVERFLOW => "EOVERFLOW",
        libc::EOWNERDEAD => "EOWNERDEAD",
        libc::EPERM => "EPERM",
        libc::EPFNOSUPPORT => "EPFNOSUPPORT",
        libc::EPIPE => "EPIPE",
        libc::EPROTO => "EPROTO",
        libc::EPROTONOSUPPORT => "EPROTONOSUPPORT",
        libc::EPROTOTYPE => "EPROTOTYPE",
        libc::ERANGE => "ERANGE",
        libc::EREMOTE => "EREMOTE",
        libc::EROFS => "EROFS",
        libc::ESHUTDOWN => "ESHUTDOWN",
        libc::ESOCKTNOSUPPORT => "ESOCKTNOSUPPORT",
        libc::ESPIPE => "ESPIPE",
        libc::ESRCH => "ESRCH",
        libc::ESTALE => "ESTALE",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ETOOMANYREFS => "ETOOMANYREFS",
        libc::ETXTBSY => "ETXTBSY",
        libc::EUSERS => "EUSERS",
        libc::EXDEV => "EXDEV",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes_are_alphabetical_positions() {
        assert_eq!(ErrorCode::from_name("E2BIG"), Some(ErrorCode(50)));
        assert_eq!(ErrorCode::from_name("EACCES"), Some(ErrorCode::EACCES));
        assert_eq!(ErrorCode::from_name("ENOENT"), Some(ErrorCode::ENOENT));
        assert_eq!(ErrorCode::from_name("EXFULL"), Some(ErrorCode(196)));
        assert_eq!(ErrorCode::ENOSPC.name(), Some("ENOSPC"));
        assert_eq!(ErrorCode::ETIMEDOUT.name(), Some("ETIMEDOUT"));
    }

    #[test]
    fn test_native_errno_translation() {
        assert_eq!(ErrorCode::from_errno(libc::ENOENT), ErrorCode::ENOENT);
        assert_eq!(ErrorCode::from_errno(libc::ENOSPC), ErrorCode::ENOSPC);
        assert_eq!(
            ErrorCode::from_errno(100_000),
            ErrorCode::UNIX_ERROR_WITHOUT_TRANSLATION
        );
    }

    #[test]
    fn test_fs_error_strips_os_suffix() {
        let err = Error::fs(&io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.code(), ErrorCode::ENOENT);
        assert!(!err.to_string().contains("os error"));
        assert!(!err.force_shutdown());
        assert!(err.with_shutdown().force_shutdown());
    }

    #[test]
    fn test_message_truncation_respects_char_boundary() {
        let long = "é".repeat(300);
        let cut = truncate_message(&long);
        assert!(cut.len() <= MAX_ERROR_MESSAGE);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_internal_descriptions() {
        assert_eq!(
            ErrorCode::SERVER_CLOSED_IDLE_CLIENT.describe(),
            "server closed idle client"
        );
        assert_eq!(ErrorCode(40).describe(), "remote returned invalid error");
    }
}
