use crate::protocol::mysql::constants::SqlComInfo;
use async_trait::async_trait;
use common::metrics::common_labels;
use mysql_common::constants::CapabilityFlags;
use std::sync::OnceLock;

use std::collections::HashMap;
use std::vec;

pub mod auth;
pub mod cli_args;
pub mod dispatcher;
pub mod proxy_server;

#[macro_export]
macro_rules! parse_err_packet {
    ($capabilities:expr, $packet:expr,$err_msg:expr) => {
        use mysql_common::io::ParseBuf;
        use mysql_common::proto::MyDeserialize;
        use tracing::warn;

        let err_packet =
            mysql_common::packets::ErrPacket::deserialize($capabilities, &mut ParseBuf(&$packet))
                .unwrap();
        let server_error = err_packet.server_error();
        let server_err_msg = server_error.message_str();
        warn!("{:?} {:?}", $err_msg, server_err_msg);
    };
}

pub const DEFAULT_BACKEND_VERSION: &[u8] = b"11.1.2-MariaDB-1:11.1.2+maria~ubu2204";
pub const PROXY_COM_METRIC_LABEL_KEY: &str = "proxy_com";
pub const PROXY_CONN_METRIC_LABEL_KEY: &str = "proxy_conn";

pub static DEFAULT_CAPABILITIES_ONCE: OnceLock<CapabilityFlags> = OnceLock::new();

static PROXY_COM: OnceLock<HashMap<u8, Vec<(&'static str, String)>>> = OnceLock::new();

pub fn init_sql_com_labels() -> &'static HashMap<u8, Vec<(&'static str, String)>> {
    PROXY_COM.get_or_init(|| {
        let process_labels = common_labels();
        let code_and_str = SqlComInfo::all_sql_com();
        let all_labels = code_and_str
            .iter()
            .map(|(com_code, com_str)| {
                (
                    *com_code,
                    [
                        &vec![(PROXY_COM_METRIC_LABEL_KEY, com_str.to_string())][..],
                        &process_labels[..],
                    ]
                    .concat(),
                )
            })
            .collect::<HashMap<u8, Vec<(&'static str, String)>>>();
        all_labels
    })
}

// CLIENT_QUERY_ATTRIBUTES new capability flag.
// MariaDB 10.6: not include this attribute.
// MySQL 8.0.34: default include this attribute.
// COM_QUERY: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query.html
pub fn default_capabilities() -> CapabilityFlags {
    *DEFAULT_CAPABILITIES_ONCE.get_or_init(|| {
        CapabilityFlags::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_FOUND_ROWS
            | CapabilityFlags::CLIENT_IGNORE_SIGPIPE
            | CapabilityFlags::CLIENT_IGNORE_SPACE
            | CapabilityFlags::CLIENT_INTERACTIVE
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_NO_SCHEMA
            | CapabilityFlags::CLIENT_ODBC
            | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            // | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
            | CapabilityFlags::CLIENT_REMEMBER_OPTIONS
            | CapabilityFlags::CLIENT_RESERVED
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_TRANSACTIONS
    })
}

/// `ProxyServer` is the abstract core feature of the MySQL proxy server: accept one
/// client connection, authenticate it (`server::auth`), bind it to a `Session`
/// (`session::session`) and run the command dispatch loop (`server::dispatcher`)
/// until the client disconnects.
#[async_trait]
pub trait ProxyServer: Send + Sync {
    async fn serve_connection(&self, stream: tokio::net::TcpStream) -> Result<(), std::io::Error>;

    async fn close(&self);
}
