/// MySQL server error codes and SQLSTATEs the proxy can surface on the frontend wire.
///
/// Only the subset this proxy actually emits is represented — this is not a complete
/// mirror of `mysqld_error.h`.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_BAD_DB_ERROR = 1049,
    ER_UNKNOWN_ERROR = 1105,
    ER_SYNTAX_ERROR = 1149,
    ER_NOT_SUPPORTED_YET = 1235,
    ER_UNKNOWN_STMT_HANDLER = 1243,
    ER_UNSUPPORTED_PS = 1295,
    ER_ACCESS_DENIED_NO_PASSWORD_ERROR = 1698,
    ER_MALFORMED_PACKET = 1835,
}

impl ErrorKind {
    /// The 5-character SQLSTATE associated with this error, without the leading `#`.
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_UNKNOWN_COM_ERROR => b"08S01",
            ErrorKind::ER_BAD_DB_ERROR => b"42000",
            ErrorKind::ER_UNKNOWN_ERROR => b"HY000",
            ErrorKind::ER_SYNTAX_ERROR => b"42000",
            ErrorKind::ER_NOT_SUPPORTED_YET => b"42000",
            ErrorKind::ER_UNKNOWN_STMT_HANDLER => b"HY000",
            ErrorKind::ER_UNSUPPORTED_PS => b"HY000",
            ErrorKind::ER_ACCESS_DENIED_NO_PASSWORD_ERROR => b"28000",
            ErrorKind::ER_MALFORMED_PACKET => b"HY000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_is_five_bytes() {
        for kind in [
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            ErrorKind::ER_BAD_DB_ERROR,
            ErrorKind::ER_UNKNOWN_STMT_HANDLER,
            ErrorKind::ER_MALFORMED_PACKET,
        ] {
            assert_eq!(kind.sqlstate().len(), 5);
        }
    }

    #[test]
    fn error_codes_match_mysqld_error_h() {
        assert_eq!(ErrorKind::ER_BAD_DB_ERROR as u16, 1049);
        assert_eq!(ErrorKind::ER_UNKNOWN_STMT_HANDLER as u16, 1243);
        assert_eq!(ErrorKind::ER_UNSUPPORTED_PS as u16, 1295);
    }
}
