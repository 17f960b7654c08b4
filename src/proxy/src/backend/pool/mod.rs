use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub const BACKEND_CLIENT_DEFAULT_IDLE: Duration = Duration::from_secs(60 * 60);

/// Sizing knobs for backend dialing. The proxy does not pool backend connections
/// itself (connection pooling is an external collaborator, see `spec.md` §1) — this
/// only bounds how many concurrent sessions a single proxy process will dial out for,
/// surfaced via `server::cli_args`.
#[derive(Debug, Clone)]
pub struct BackendPoolConfig {
    pub max_size: u32,
    pub time_to_idle: Duration,
}

impl Default for BackendPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            time_to_idle: BACKEND_CLIENT_DEFAULT_IDLE,
        }
    }
}

pub type BackendIoHalves = (PacketReader<OwnedReadHalf>, PacketWriter<OwnedWriteHalf>);

/// Dials a backend MySQL server and wraps the split TCP stream in the same
/// packet-framed reader/writer pair used for the frontend connection.
pub async fn dial(backend_addr: &str) -> Result<BackendIoHalves, std::io::Error> {
    let std_tcp_stream = std::net::TcpStream::connect(backend_addr)?;
    std_tcp_stream.set_nonblocking(true)?;
    let tcp_stream = tokio::net::TcpStream::from_std(std_tcp_stream)?;
    tcp_stream.set_nodelay(true)?;
    let (reader, writer) = tcp_stream.into_split();
    Ok((PacketReader::new(reader), PacketWriter::new(writer)))
}
