//! Backend Connection: speaks the *client* side of the MySQL wire protocol
//! against a single backend MySQL server. One instance is bound exclusively
//! to one `Session` for the lifetime of its binding (`spec.md` §5) — there is
//! no connection pooling or re-authentication at this layer, see `DESIGN.md`.

use crate::protocol::mysql::basic::{eof_server_status, ok_packet, read_length_encoded_number};
use crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::auth::{sha1_1, sha1_2, xor};
use crate::server::default_capabilities;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const BACKEND_MAX_PACKET_LEN: u32 = 16_777_216;

/// Cached metadata for a prepared statement, dumped verbatim from the
/// backend's `COM_STMT_PREPARE_OK` response so it can be replayed to the
/// client without re-parsing column definitions.
#[derive(Debug, Clone)]
pub struct PreparedMeta {
    pub backend_stmt_id: u32,
    pub param_count: u16,
    pub column_count: u16,
    pub header: Vec<u8>,
    pub param_packets: Vec<Vec<u8>>,
    pub column_packets: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub enum PrepareOutcome {
    Prepared(PreparedMeta),
    /// Raw ERR packet payload from the backend, forwarded verbatim.
    Error(Vec<u8>),
}

/// An authenticated connection to one backend MySQL server. Generic over the
/// reader/writer halves so tests can drive it over an in-memory duplex pipe
/// instead of a real socket.
pub struct BackendConnection<R = OwnedReadHalf, W = OwnedWriteHalf> {
    pub reader: PacketReader<R>,
    pub writer: PacketWriter<W>,
    pub capabilities: CapabilityFlags,
    pub addr: String,
}

impl BackendConnection<OwnedReadHalf, OwnedWriteHalf> {
    /// Dials `addr` and completes the connection-phase handshake.
    pub async fn connect(
        addr: &str,
        username: &str,
        password: &str,
        database: Option<&str>,
    ) -> io::Result<Self> {
        let (reader, writer) = super::pool::dial(addr).await?;
        Self::open(reader, writer, addr.to_string(), username, password, database).await
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> BackendConnection<R, W> {
    /// Completes the handshake over an already-connected reader/writer pair.
    pub async fn open(
        mut reader: PacketReader<R>,
        mut writer: PacketWriter<W>,
        addr: String,
        username: &str,
        password: &str,
        database: Option<&str>,
    ) -> io::Result<Self> {
        let (_, handshake_pkt) = reader.next_async().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("backend {addr} closed before sending its handshake"),
            )
        })?;
        let (scramble, server_caps) = parse_initial_handshake(handshake_pkt.as_ref())?;

        let mut capabilities = (default_capabilities() & server_caps
            & !CapabilityFlags::CLIENT_CONNECT_ATTRS)
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION;
        capabilities = if database.is_some() {
            capabilities | CapabilityFlags::CLIENT_CONNECT_WITH_DB
        } else {
            capabilities & !CapabilityFlags::CLIENT_CONNECT_WITH_DB
        };

        let auth_response = native_password_scramble(password, &scramble);
        let payload = build_handshake_response(capabilities, username, &auth_response, database);

        writer.reset_seq();
        writer.set_seq(1);
        writer.write_all(&payload)?;
        writer.end_packet().await?;
        writer.flush_all().await?;

        let (_, response_pkt) = reader.next_async().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("backend {addr} closed before completing authentication"),
            )
        })?;
        if response_pkt.is_err_packet() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "backend {addr} rejected authentication: {:?}",
                    response_pkt.as_ref()
                ),
            ));
        }

        Ok(Self {
            reader,
            writer,
            capabilities,
            addr,
        })
    }

    async fn send_command(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.reset_seq();
        self.writer.write_all(payload)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await
    }

    async fn read_packet(&mut self) -> io::Result<Packet> {
        let (_, pkt) = self.reader.next_async().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("backend {} closed the connection", self.addr),
            )
        })?;
        Ok(pkt)
    }

    /// Sends an arbitrary single-reply command (`COM_INIT_DB`, `COM_PING`, ...)
    /// and returns the raw OK/ERR packet for the caller to forward verbatim.
    pub async fn simple_command(&mut self, command: CommandCode, payload: &[u8]) -> io::Result<Packet> {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(command as u8);
        buf.extend_from_slice(payload);
        self.send_command(&buf).await?;
        self.read_packet().await
    }

    /// `COM_STMT_PREPARE`: forwards the statement text and buffers the raw
    /// response packets (header + param/column definitions) for the caller
    /// to replay to the client.
    pub async fn prepare(&mut self, sql: &[u8]) -> io::Result<PrepareOutcome> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(CommandCode::ComStmtPrepare as u8);
        payload.extend_from_slice(sql);
        self.send_command(&payload).await?;

        let header = self.read_packet().await?;
        if header.is_err_packet() {
            return Ok(PrepareOutcome::Error(header.as_ref().to_vec()));
        }
        let body = header.as_ref();
        if body.len() < 9 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short COM_STMT_PREPARE_OK packet",
            ));
        }
        let backend_stmt_id = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        let column_count = u16::from_le_bytes([body[5], body[6]]);
        let param_count = u16::from_le_bytes([body[7], body[8]]);

        let mut param_packets = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            param_packets.push(self.read_packet().await?.as_ref().to_vec());
        }
        if param_count > 0 && !self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            self.read_packet().await?;
        }

        let mut column_packets = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            column_packets.push(self.read_packet().await?.as_ref().to_vec());
        }
        if column_count > 0 && !self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            self.read_packet().await?;
        }

        Ok(PrepareOutcome::Prepared(PreparedMeta {
            backend_stmt_id,
            param_count,
            column_count,
            header: body.to_vec(),
            param_packets,
            column_packets,
        }))
    }

    /// `COM_STMT_CLOSE`: fire-and-forget per the protocol, no reply expected.
    pub async fn close_stmt(&mut self, backend_stmt_id: u32) -> io::Result<()> {
        let mut payload = Vec::with_capacity(5);
        payload.push(CommandCode::ComStmtClose as u8);
        payload.extend_from_slice(&backend_stmt_id.to_le_bytes());
        self.send_command(&payload).await
    }

    /// `COM_QUERY`: sends `sql` and streams the response straight through to
    /// `client_writer`, never buffering a full result set in memory.
    pub async fn query_and_stream<CW: AsyncWrite + Unpin>(
        &mut self,
        sql: &[u8],
        client_writer: &mut PacketWriter<CW>,
    ) -> io::Result<StatusFlags> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(CommandCode::ComQuery as u8);
        payload.extend_from_slice(sql);
        self.send_command(&payload).await?;
        self.stream_result(client_writer).await
    }

    /// `COM_STMT_EXECUTE`: `raw_execute_payload` is the client's packet body
    /// unchanged (command byte included) — statement ids pass through
    /// unremapped, see `DESIGN.md` Open Question 4.
    pub async fn exec_and_stream<CW: AsyncWrite + Unpin>(
        &mut self,
        raw_execute_payload: &[u8],
        client_writer: &mut PacketWriter<CW>,
    ) -> io::Result<StatusFlags> {
        self.send_command(raw_execute_payload).await?;
        self.stream_result(client_writer).await
    }

    /// Forwards one command's response (OK/ERR, or a full result set,
    /// including chained multi-statement results) packet-by-packet.
    async fn stream_result<CW: AsyncWrite + Unpin>(
        &mut self,
        client_writer: &mut PacketWriter<CW>,
    ) -> io::Result<StatusFlags> {
        loop {
            let header = self.read_packet().await?;
            forward_raw(client_writer, &header).await?;

            if header.is_err_packet() {
                return Ok(StatusFlags::empty());
            }
            if header.is_ok_packet() {
                let status = self.ok_status(&header)?;
                if status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                    continue;
                }
                return Ok(status);
            }

            let (_, column_count) = read_length_encoded_number(header.as_ref())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad column-count packet"))?;

            for _ in 0..column_count {
                let col = self.read_packet().await?;
                forward_raw(client_writer, &col).await?;
            }
            if !self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                let eof = self.read_packet().await?;
                forward_raw(client_writer, &eof).await?;
            }

            let final_status = loop {
                let row = self.read_packet().await?;
                forward_raw(client_writer, &row).await?;
                if row.is_err_packet() {
                    break StatusFlags::empty();
                }
                if self.capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                    if row.is_ok_packet() {
                        break self.ok_status(&row)?;
                    }
                } else if row.is_eof_packet() {
                    let (_, status) = eof_server_status(row.as_ref())
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad eof status"))?;
                    break status;
                }
            };

            if final_status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                continue;
            }
            return Ok(final_status);
        }
    }

    fn ok_status(&self, packet: &Packet) -> io::Result<StatusFlags> {
        let (_, ok) = ok_packet(packet.as_ref(), self.capabilities)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad OK packet"))?;
        Ok(ok.status_flags)
    }
}

async fn forward_raw<W: AsyncWrite + Unpin>(
    client_writer: &mut PacketWriter<W>,
    packet: &Packet,
) -> io::Result<()> {
    client_writer.write_all(packet.as_ref())?;
    client_writer.end_packet().await
}

fn native_password_scramble(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = sha1_1(password.as_bytes());
    let stage2 = sha1_1(stage1);
    let inter = sha1_2(scramble, stage2);
    xor(inter, stage1).to_vec()
}

fn build_handshake_response(
    capabilities: CapabilityFlags,
    username: &str,
    auth_response: &[u8],
    database: Option<&str>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&capabilities.bits().to_le_bytes());
    out.extend_from_slice(&BACKEND_MAX_PACKET_LEN.to_le_bytes());
    out.push(crate::protocol::mysql::charset::DEFAULT_COLLATION_ID as u8);
    out.extend_from_slice(&[0u8; 23]);
    out.extend_from_slice(username.as_bytes());
    out.push(0);

    if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        let _ = out.write_lenenc_int(auth_response.len() as u64);
        out.extend_from_slice(auth_response);
    } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        out.push(auth_response.len() as u8);
        out.extend_from_slice(auth_response);
    } else {
        out.extend_from_slice(auth_response);
        out.push(0);
    }

    if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        if let Some(db) = database {
            out.extend_from_slice(db.as_bytes());
            out.push(0);
        }
    }

    if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        out.extend_from_slice(AuthNativePassword.as_ref().as_bytes());
        out.push(0);
    }
    out
}

/// Mirrors `writers::write_initial_handshake`'s layout in reverse.
fn parse_initial_handshake(payload: &[u8]) -> io::Result<(Vec<u8>, CapabilityFlags)> {
    let too_short = || io::Error::new(io::ErrorKind::InvalidData, "short initial handshake packet");
    if payload.is_empty() {
        return Err(too_short());
    }
    let mut pos = 1; // protocol_version
    let version_len = payload[pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(too_short)?;
    pos += version_len + 1;
    pos += 4; // connection_id
    if payload.len() < pos + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 {
        return Err(too_short());
    }
    let mut scramble = payload[pos..pos + 8].to_vec();
    pos += 8;
    pos += 1; // filler
    let cap_lower = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;
    pos += 1; // charset
    pos += 2; // status flags
    let cap_upper = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;
    let auth_plugin_data_len = payload[pos] as usize;
    pos += 1;
    pos += 10; // reserved

    let capabilities = CapabilityFlags::from_bits_truncate((cap_upper as u32) << 16 | cap_lower as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let part2_len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8));
        let take = part2_len.saturating_sub(1).min(payload.len().saturating_sub(pos));
        scramble.extend_from_slice(&payload[pos..pos + take]);
    }
    Ok((scramble, capabilities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::writers::{
        write_initial_handshake, write_ok_packet_with_client_flags, write_prepare_ok,
    };
    use crate::protocol::mysql::basic::{Column, OkPacket};
    use mysql_common::constants::ColumnType;

    async fn fake_backend(mut reader: PacketReader<tokio::io::DuplexStream>, mut writer: PacketWriter<tokio::io::DuplexStream>) {
        writer.reset_seq();
        write_initial_handshake(
            &mut writer,
            1,
            crate::server::auth::default_salt(),
            b"8.0.34-fake",
            #[cfg(feature = "tls")]
            &None,
        )
        .await
        .unwrap();
        // drain the client's handshake response.
        reader.next_async().await.unwrap().unwrap();
        writer.reset_seq();
        writer.set_seq(2);
        write_ok_packet_with_client_flags(
            &mut writer,
            default_capabilities(),
            OkPacket {
                header: 0,
                status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let (_, cmd) = reader.next_async().await.unwrap().unwrap();
        match cmd.as_ref()[0] {
            x if x == CommandCode::ComQuery as u8 => {
                writer.reset_seq();
                writer.set_seq(1);
                write_ok_packet_with_client_flags(
                    &mut writer,
                    default_capabilities(),
                    OkPacket {
                        header: 0,
                        affected_rows: 1,
                        status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            }
            x if x == CommandCode::ComStmtPrepare as u8 => {
                writer.reset_seq();
                writer.set_seq(1);
                let columns = vec![Column {
                    table: "t".into(),
                    column: "id".into(),
                    column_type: ColumnType::MYSQL_TYPE_LONG,
                    column_flags: mysql_common::constants::ColumnFlags::empty(),
                }];
                let params: Vec<Column> = Vec::new();
                write_prepare_ok(7, &params, &columns, &mut writer, default_capabilities())
                    .await
                    .unwrap();
            }
            _ => unreachable!("unexpected command in fake backend"),
        }
    }

    #[tokio::test]
    async fn connect_and_query_round_trip() {
        let (client_half, server_half) = tokio::io::duplex(8192);
        let (server_read, server_write) = tokio::io::split(server_half);
        tokio::spawn(fake_backend(PacketReader::new(server_read), PacketWriter::new(server_write)));

        let (client_read, client_write) = tokio::io::split(client_half);
        let mut backend = BackendConnection::open(
            PacketReader::new(client_read),
            PacketWriter::new(client_write),
            "duplex".to_string(),
            "root",
            "",
            None,
        )
        .await
        .unwrap();

        let (sink_read, sink_write) = tokio::io::duplex(8192);
        drop(sink_read);
        let mut client_writer = PacketWriter::new(sink_write);
        client_writer.set_seq(1);
        let status = backend.query_and_stream(b"SELECT 1", &mut client_writer).await.unwrap();
        assert!(status.contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
    }

    #[tokio::test]
    async fn prepare_caches_column_definitions() {
        let (client_half, server_half) = tokio::io::duplex(8192);
        let (server_read, server_write) = tokio::io::split(server_half);
        tokio::spawn(fake_backend(PacketReader::new(server_read), PacketWriter::new(server_write)));

        let (client_read, client_write) = tokio::io::split(client_half);
        let mut backend = BackendConnection::open(
            PacketReader::new(client_read),
            PacketWriter::new(client_write),
            "duplex".to_string(),
            "root",
            "",
            None,
        )
        .await
        .unwrap();

        match backend.prepare(b"SELECT id FROM t WHERE id = ?").await.unwrap() {
            PrepareOutcome::Prepared(meta) => {
                assert_eq!(meta.backend_stmt_id, 7);
                assert_eq!(meta.column_count, 1);
                assert_eq!(meta.param_count, 0);
                assert_eq!(meta.column_packets.len(), 1);
            }
            PrepareOutcome::Error(_) => panic!("expected a successful prepare"),
        }
    }
}
