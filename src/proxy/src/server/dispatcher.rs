//! Per-session command loop: reads one command packet per turn and
//! demultiplexes on the first byte (`spec.md` §4.1). Generalized from the
//! teacher's `server/haentgl_server.rs::on_com` / `server/static_proxy.rs::on_cmd`
//! — same command-byte `match` shape and per-turn `reset_seq()`, with real
//! Registry/Router/Classifier logic replacing teacher-specific forwarding.

use crate::backend::cluster::ClusterResolver;
use crate::backend::conn::{BackendConnection, PrepareOutcome};
use crate::protocol::mysql::basic::{from_packet, Column, Command};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::{
    write_column_definitions, write_eof_packet, write_err, write_ok_packet_with_client_flags,
};
use crate::protocol::mysql::basic::OkPacket;
use crate::server::init_sql_com_labels;
use crate::session::classifier::{Statement, SqlClassifier};
use crate::session::router::{self, RouteTarget};
use crate::session::Session;

use common::metrics::metric_def::PROXY_COM_LATENCY;
use common::metrics::MetricsTimer;
use mysql_common::constants::{CapabilityFlags, ColumnFlags, ColumnType, StatusFlags};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Runs the command loop for one already-authenticated session until
/// `COM_QUIT`, a transport error, or a protocol violation. Each suspension
/// point (client read, client write, backend I/O) is an `await`, matching
/// `spec.md` §5.
pub async fn run<R, W>(
    session: &mut Session,
    client_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    resolver: &dyn ClusterResolver,
    classifier: &dyn SqlClassifier,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some((_, packet)) = client_reader.next_async().await? else {
            return Ok(());
        };
        client_writer.reset_seq();
        client_writer.set_seq(1);

        let raw = packet.as_ref();
        if raw.is_empty() {
            warn!("empty command packet");
            write_err(ErrorKind::ER_MALFORMED_PACKET, b"empty command packet", client_writer)
                .await?;
            continue;
        }
        let command_byte = raw[0];
        session.last_command = command_byte;
        debug!(command = command_byte, "dispatch turn");

        let _com_latency = init_sql_com_labels()
            .get(&command_byte)
            .map(|labels| MetricsTimer::new_with_labels(PROXY_COM_LATENCY, labels));

        if command_byte == CommandCode::ComQuit as u8 {
            return Ok(());
        }
        if command_byte == CommandCode::ComPing as u8 {
            write_ok_packet_with_client_flags(
                client_writer,
                session.client_capabilities,
                ok_packet(session),
            )
            .await?;
            continue;
        }
        if command_byte == CommandCode::ComFieldList as u8 {
            warn!(command = command_byte, "COM_FIELD_LIST is not supported");
            write_err(
                ErrorKind::ER_NOT_SUPPORTED_YET,
                b"COM_FIELD_LIST is not supported",
                client_writer,
            )
            .await?;
            continue;
        }
        if command_byte == CommandCode::ComStmtSendLongData as u8
            || command_byte == CommandCode::ComStmtReset as u8
        {
            // DESIGN.md Open Question 1: rejected with a stable error rather
            // than silently accepted, matching the original's own
            // commented-out (never-shipped) handling of these commands.
            warn!(command = command_byte, "COM_STMT_SEND_LONG_DATA/COM_STMT_RESET are not supported");
            write_err(
                ErrorKind::ER_UNSUPPORTED_PS,
                b"COM_STMT_SEND_LONG_DATA/COM_STMT_RESET are not supported",
                client_writer,
            )
            .await?;
            continue;
        }
        if command_byte == CommandCode::ComStmtExecute as u8 && raw.len() < 10 {
            warn!(command = command_byte, len = raw.len(), "malformed COM_STMT_EXECUTE payload");
            write_err(ErrorKind::ER_MALFORMED_PACKET, b"short COM_STMT_EXECUTE", client_writer)
                .await?;
            continue;
        }

        match from_packet(raw) {
            Ok((_, Command::Init(db))) => {
                handle_init_db(session, resolver, db, client_writer).await?;
            }
            Ok((_, Command::Query(sql))) => {
                handle_query(session, classifier, sql, client_writer).await?;
            }
            Ok((_, Command::Prepare(sql))) => {
                handle_prepare(session, classifier, sql, client_writer).await?;
            }
            Ok((_, Command::Execute { .. })) => {
                handle_execute(session, raw, client_writer).await?;
            }
            Ok((_, Command::Close(stmt_id))) => {
                handle_close(session, stmt_id).await;
                // STMT_CLOSE has no reply per the protocol.
            }
            Ok((_, Command::ListFields(_))) => {
                warn!(command = command_byte, "COM_FIELD_LIST is not supported");
                write_err(
                    ErrorKind::ER_NOT_SUPPORTED_YET,
                    b"COM_FIELD_LIST is not supported",
                    client_writer,
                )
                .await?;
            }
            _ => {
                warn!(command = command_byte, "command not supported");
                write_err(
                    ErrorKind::ER_UNKNOWN_ERROR,
                    format!("command {command_byte} not supported").as_bytes(),
                    client_writer,
                )
                .await?;
            }
        }
    }
}

fn ok_packet(session: &Session) -> OkPacket {
    let mut status = StatusFlags::empty();
    if session.in_autocommit {
        status |= StatusFlags::SERVER_STATUS_AUTOCOMMIT;
    }
    if session.in_transaction {
        status |= StatusFlags::SERVER_STATUS_IN_TRANS;
    }
    OkPacket {
        status_flags: status,
        ..Default::default()
    }
}

async fn handle_init_db<W: AsyncWrite + Unpin>(
    session: &mut Session,
    resolver: &dyn ClusterResolver,
    db: &[u8],
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()> {
    let db_name = String::from_utf8_lossy(db).to_string();
    match session.bind(resolver, &db_name).await {
        Ok(()) => {
            write_ok_packet_with_client_flags(client_writer, session.client_capabilities, ok_packet(session))
                .await
        }
        Err(kind) => {
            warn!(?kind, db = %db_name, "COM_INIT_DB failed");
            write_err(kind, db_name.as_bytes(), client_writer).await
        }
    }
}

/// `SHOW DATABASES` bypasses the backend entirely (`spec.md` §4.4): a
/// synthetic single-column, single-row result set naming only the session's
/// bound database — intentional multi-tenant isolation, not a bug (`spec.md`
/// §9).
async fn reply_show_databases<W: AsyncWrite + Unpin>(
    session: &Session,
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()> {
    let db_name = session.bound_db_name().unwrap_or("").to_string();
    let columns = [Column {
        table: String::new(),
        column: "Database".to_string(),
        column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
        column_flags: ColumnFlags::empty(),
    }];
    write_column_definitions(&columns, client_writer, session.client_capabilities).await?;

    use mysql_common::io::WriteMysqlExt;
    use std::io::Write;
    client_writer.write_lenenc_str(db_name.as_bytes())?;
    client_writer.end_packet().await?;

    if !session
        .client_capabilities
        .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    {
        write_eof_packet(client_writer, StatusFlags::empty()).await?;
    }
    Ok(())
}

fn select_backend(session: &mut Session, target: RouteTarget) -> Option<&mut BackendConnection> {
    match target {
        RouteTarget::Master => session.master_mut(),
        RouteTarget::Replica => session.replica_mut(),
    }
}

async fn handle_query<W: AsyncWrite + Unpin>(
    session: &mut Session,
    classifier: &dyn SqlClassifier,
    sql: &[u8],
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()> {
    let sql_str = String::from_utf8_lossy(sql).to_string();

    let classified = match classifier.classify(&sql_str) {
        Ok(stmt) => stmt,
        Err(e) => {
            warn!(error = %e.0, "failed to classify query");
            return write_err(ErrorKind::ER_SYNTAX_ERROR, e.0.as_bytes(), client_writer).await;
        }
    };

    if classified == Statement::ShowDatabases {
        return reply_show_databases(session, client_writer).await;
    }

    if let Some(boundary) = router::transaction_boundary(&sql_str) {
        match boundary {
            router::TxBoundary::Begin => session.in_transaction = true,
            router::TxBoundary::End => session.in_transaction = false,
        }
    }

    let target = router::route(&classified, session.in_transaction, session.in_autocommit);
    let Some(backend) = select_backend(session, target) else {
        warn!("query issued on an unbound session");
        return write_err(
            ErrorKind::ER_BAD_DB_ERROR,
            b"session is not bound to a database",
            client_writer,
        )
        .await;
    };

    match backend.query_and_stream(sql, client_writer).await {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = ?e, "backend transport error on query, invalidating binding");
            session.invalidate_binding();
            Err(e)
        }
    }
}

async fn handle_prepare<W: AsyncWrite + Unpin>(
    session: &mut Session,
    classifier: &dyn SqlClassifier,
    sql: &[u8],
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()> {
    let sql_str = String::from_utf8_lossy(sql).to_string();

    let classified = match classifier.classify(&sql_str) {
        Ok(stmt) => stmt,
        Err(e) => {
            warn!(error = %e.0, "failed to classify statement to prepare");
            return write_err(ErrorKind::ER_SYNTAX_ERROR, e.0.as_bytes(), client_writer).await;
        }
    };
    if !classified.is_preparable() {
        warn!(?classified, "statement class is not preparable");
        return write_err(
            ErrorKind::ER_UNSUPPORTED_PS,
            b"statement class is not preparable",
            client_writer,
        )
        .await;
    }
    if classified.is_ddl() {
        // `spec.md` §4.6 step 1: DDL parses but is accepted as a no-op
        // success, never touching a backend.
        use crate::protocol::mysql::packet::writers::write_prepare_ok;
        let empty: Vec<Column> = Vec::new();
        return write_prepare_ok(0, &empty, &empty, client_writer, session.client_capabilities)
            .await;
    }

    let target = router::route(&classified, session.in_transaction, session.in_autocommit);
    let Some(backend) = select_backend(session, target) else {
        warn!("prepare issued on an unbound session");
        return write_err(
            ErrorKind::ER_BAD_DB_ERROR,
            b"session is not bound to a database",
            client_writer,
        )
        .await;
    };

    match backend.prepare(sql).await {
        Ok(PrepareOutcome::Error(raw_err)) => {
            client_writer.write_raw(&raw_err).await
        }
        Ok(PrepareOutcome::Prepared(meta)) => {
            let frontend_id = meta.backend_stmt_id;
            client_writer.write_raw(&meta.header).await?;
            for p in &meta.param_packets {
                client_writer.write_raw(p).await?;
            }
            if meta.param_count > 0
                && !session
                    .client_capabilities
                    .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
            {
                write_eof_packet(client_writer, StatusFlags::empty()).await?;
            }
            for c in &meta.column_packets {
                client_writer.write_raw(c).await?;
            }
            if meta.column_count > 0
                && !session
                    .client_capabilities
                    .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
            {
                write_eof_packet(client_writer, StatusFlags::empty()).await?;
            }
            session.registry.insert(frontend_id, classified, meta, target);
            Ok(())
        }
        Err(e) => {
            warn!(error = ?e, "backend transport error on prepare, invalidating binding");
            session.invalidate_binding();
            Err(e)
        }
    }
}

async fn handle_execute<W: AsyncWrite + Unpin>(
    session: &mut Session,
    raw_command_packet: &[u8],
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()> {
    // byte 0: command; bytes 1-4: stmt id; byte 5: cursor flag; bytes 6-9: iteration count.
    // The caller (`run`) already rejected payloads shorter than 10 bytes
    // before dispatching here.
    let stmt_id = u32::from_le_bytes([
        raw_command_packet[1],
        raw_command_packet[2],
        raw_command_packet[3],
        raw_command_packet[4],
    ]);
    let cursor_flag = raw_command_packet[5];
    if cursor_flag != 0 {
        warn!(cursor_flag, "unsupported cursor flag in COM_STMT_EXECUTE");
        return write_err(
            ErrorKind::ER_UNKNOWN_ERROR,
            format!("unsupported cursor flag {cursor_flag}").as_bytes(),
            client_writer,
        )
        .await;
    }

    let Some(entry) = session.registry.get(stmt_id) else {
        warn!(stmt_id, "unknown statement handler");
        return write_err(
            ErrorKind::ER_UNKNOWN_STMT_HANDLER,
            format!("unknown statement handler {stmt_id}").as_bytes(),
            client_writer,
        )
        .await;
    };
    let target = entry.target;

    let Some(backend) = select_backend(session, target) else {
        warn!(stmt_id, "execute issued on an unbound session");
        return write_err(
            ErrorKind::ER_BAD_DB_ERROR,
            b"session is not bound to a database",
            client_writer,
        )
        .await;
    };

    match backend.exec_and_stream(raw_command_packet, client_writer).await {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = ?e, "backend transport error on execute, invalidating binding");
            session.invalidate_binding();
            Err(e)
        }
    }
}

async fn handle_close(session: &mut Session, stmt_id: u32) {
    let Some(entry) = session.registry.remove(stmt_id) else {
        return;
    };
    let backend_stmt_id = entry.meta.backend_stmt_id;
    if let Some(backend) = select_backend(session, entry.target) {
        if let Err(e) = backend.close_stmt(backend_stmt_id).await {
            warn!(error = ?e, stmt_id, "failed to close prepared statement on backend");
        }
    }
}

/// Exercises the command loop end to end (`spec.md` §8). Master/replica are
/// real loopback TCP servers speaking just enough of the protocol to
/// authenticate and answer one command at a time — `Session`'s backend
/// fields are concretely `BackendConnection<OwnedReadHalf, OwnedWriteHalf>`
/// (see `backend::conn`), so unlike the generic `PacketReader`/`PacketWriter`
/// tests in `backend/conn.rs` an in-memory `tokio::io::duplex` pair can't
/// stand in for a backend here; it's used only for the client side, which
/// the handlers are generic over.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cluster::{ClusterSpec, StaticClusterResolver};
    use crate::protocol::mysql::packet::writers::write_initial_handshake;
    use crate::protocol::mysql::packet::writers::write_prepare_ok;
    use crate::session::classifier::PrefixClassifier;
    use crate::session::session::UserRecord;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::net::{TcpListener, TcpStream};

    type CallLog = Arc<Mutex<Vec<(&'static str, String)>>>;

    fn new_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn logged(log: &CallLog) -> Vec<(&'static str, String)> {
        log.lock().unwrap().clone()
    }

    async fn serve_fake_backend(tag: &'static str, stream: TcpStream, log: CallLog) {
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        let mut reader = PacketReader::new(read);
        let mut writer = PacketWriter::new(write);

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
        if reader.next_async().await.unwrap().is_none() {
            return;
        }
        writer.reset_seq();
        writer.set_seq(2);
        write_ok_packet_with_client_flags(
            &mut writer,
            crate::server::default_capabilities(),
            OkPacket {
                status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        loop {
            let Some((_, cmd)) = reader.next_async().await.unwrap() else {
                return;
            };
            let body = cmd.as_ref();
            if body.is_empty() {
                return;
            }
            match body[0] {
                x if x == CommandCode::ComQuery as u8 => {
                    let sql = String::from_utf8_lossy(&body[1..]).to_string();
                    log.lock().unwrap().push((tag, format!("QUERY {sql}")));
                    writer.reset_seq();
                    writer.set_seq(1);
                    write_ok_packet_with_client_flags(
                        &mut writer,
                        crate::server::default_capabilities(),
                        OkPacket {
                            affected_rows: 1,
                            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                }
                x if x == CommandCode::ComStmtPrepare as u8 => {
                    let sql = String::from_utf8_lossy(&body[1..]).to_string();
                    log.lock().unwrap().push((tag, format!("PREPARE {sql}")));
                    writer.reset_seq();
                    writer.set_seq(1);
                    let params = [Column {
                        table: String::new(),
                        column: "?".to_string(),
                        column_type: ColumnType::MYSQL_TYPE_LONG,
                        column_flags: ColumnFlags::empty(),
                    }];
                    let columns = [Column {
                        table: "t".to_string(),
                        column: "id".to_string(),
                        column_type: ColumnType::MYSQL_TYPE_LONG,
                        column_flags: ColumnFlags::empty(),
                    }];
                    write_prepare_ok(
                        42,
                        &params,
                        &columns,
                        &mut writer,
                        crate::server::default_capabilities(),
                    )
                    .await
                    .unwrap();
                }
                x if x == CommandCode::ComStmtExecute as u8 => {
                    let stmt_id = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
                    log.lock().unwrap().push((tag, format!("EXECUTE {stmt_id}")));
                    writer.reset_seq();
                    writer.set_seq(1);
                    write_ok_packet_with_client_flags(
                        &mut writer,
                        crate::server::default_capabilities(),
                        OkPacket {
                            affected_rows: 1,
                            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                }
                x if x == CommandCode::ComStmtClose as u8 => {
                    let stmt_id = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
                    log.lock().unwrap().push((tag, format!("CLOSE {stmt_id}")));
                }
                _ => return,
            }
        }
    }

    async fn spawn_fake_backend(tag: &'static str, log: CallLog) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_fake_backend(tag, stream, log.clone()));
            }
        });
        addr
    }

    fn user() -> UserRecord {
        UserRecord {
            username: "root".to_string(),
            default_db: "app".to_string(),
            cluster_name: "app".to_string(),
        }
    }

    fn new_session() -> Session {
        Session::new(user(), CapabilityFlags::CLIENT_PROTOCOL_41)
    }

    async fn resolver_for(log: &CallLog) -> StaticClusterResolver {
        let master_addr = spawn_fake_backend("master", log.clone()).await;
        let replica_addr = spawn_fake_backend("replica", log.clone()).await;
        StaticClusterResolver::new(vec![ClusterSpec {
            db_name: "app".to_string(),
            master_addr,
            replica_addr: Some(replica_addr),
            username: "root".to_string(),
            password: String::new(),
        }])
    }

    async fn bound_session(log: &CallLog) -> Session {
        let resolver = resolver_for(log).await;
        let mut session = new_session();
        session.bind(&resolver, "app").await.unwrap();
        session
    }

    fn client_pipe() -> (PacketWriter<DuplexStream>, PacketReader<DuplexStream>) {
        let (a, b) = tokio::io::duplex(16384);
        let mut writer = PacketWriter::new(a);
        writer.set_seq(1);
        (writer, PacketReader::new(b))
    }

    fn err_code(payload: &[u8]) -> u16 {
        assert_eq!(payload[0], 0xff, "expected an ERR packet");
        u16::from_le_bytes([payload[1], payload[2]])
    }

    // 1. INIT_DB("app") where the user's default db is "app" binds and
    //    acquires both master and replica.
    #[tokio::test]
    async fn init_db_matching_default_db_binds_and_acquires_both_backends() {
        let log = new_log();
        let resolver = resolver_for(&log).await;
        let mut session = new_session();
        let (mut writer, mut reader) = client_pipe();

        handle_init_db(&mut session, &resolver, b"app", &mut writer)
            .await
            .unwrap();

        let (_, reply) = reader.next_async().await.unwrap().unwrap();
        assert!(reply.is_ok_packet());
        assert!(session.is_bound());
        assert_eq!(session.bound_db_name(), Some("app"));
    }

    // 2. INIT_DB("other") where the user's default db is "app" fails with
    //    ER_BAD_DB_ERROR.
    #[tokio::test]
    async fn init_db_mismatched_db_fails_with_bad_db_error() {
        let log = new_log();
        let resolver = resolver_for(&log).await;
        let mut session = new_session();
        let (mut writer, mut reader) = client_pipe();

        handle_init_db(&mut session, &resolver, b"other", &mut writer)
            .await
            .unwrap();

        let (_, reply) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(err_code(reply.as_ref()), ErrorKind::ER_BAD_DB_ERROR as u16);
        assert!(!session.is_bound());
    }

    // 3. QUERY("SHOW DATABASES") after bind is answered synthetically, with
    //    no backend traffic at all.
    #[tokio::test]
    async fn show_databases_never_touches_a_backend() {
        let log = new_log();
        let mut session = bound_session(&log).await;
        let (mut writer, mut reader) = client_pipe();

        handle_query(&mut session, &PrefixClassifier, b"SHOW DATABASES", &mut writer)
            .await
            .unwrap();

        // column count, one column definition, the column-definitions EOF,
        // then the single row naming the bound database.
        let (_, column_count) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(column_count.as_ref()[0], 1); // one column
        reader.next_async().await.unwrap().unwrap(); // column definition
        reader.next_async().await.unwrap().unwrap(); // EOF
        let (_, row) = reader.next_async().await.unwrap().unwrap();
        assert!(row.as_ref().ends_with(b"app"));
        assert!(logged(&log).is_empty());
    }

    // 4. QUERY("SELECT 1") with autocommit on, no open transaction, routes to
    //    the replica.
    #[tokio::test]
    async fn autocommit_select_routes_to_replica() {
        let log = new_log();
        let mut session = bound_session(&log).await;
        let (mut writer, mut reader) = client_pipe();

        handle_query(&mut session, &PrefixClassifier, b"SELECT 1", &mut writer)
            .await
            .unwrap();
        reader.next_async().await.unwrap().unwrap();

        assert_eq!(logged(&log), vec![("replica", "QUERY SELECT 1".to_string())]);
    }

    // 5. BEGIN; SELECT 1; COMMIT all land on master and pin to the same
    //    handle for the duration of the transaction.
    #[tokio::test]
    async fn transaction_pins_every_statement_to_master() {
        let log = new_log();
        let mut session = bound_session(&log).await;

        for sql in [&b"BEGIN"[..], b"SELECT 1", b"COMMIT"] {
            let (mut writer, mut reader) = client_pipe();
            handle_query(&mut session, &PrefixClassifier, sql, &mut writer)
                .await
                .unwrap();
            reader.next_async().await.unwrap().unwrap();
        }

        let entries = logged(&log);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|(tag, _)| *tag == "master"));
        assert!(!session.in_transaction);
    }

    // 6. STMT_PREPARE("SELECT ?") then STMT_EXECUTE streams the result from
    //    the replica, reusing the backend_stmt_id handed back at prepare time.
    #[tokio::test]
    async fn prepare_then_execute_routes_through_the_same_backend() {
        let log = new_log();
        let mut session = bound_session(&log).await;

        let (mut prep_writer, mut prep_reader) = client_pipe();
        handle_prepare(&mut session, &PrefixClassifier, b"SELECT ? FROM t", &mut prep_writer)
            .await
            .unwrap();
        let (_, header) = prep_reader.next_async().await.unwrap().unwrap();
        assert_eq!(header.as_ref()[0], 0x00);
        let frontend_stmt_id = u32::from_le_bytes([
            header.as_ref()[1],
            header.as_ref()[2],
            header.as_ref()[3],
            header.as_ref()[4],
        ]);
        assert_eq!(frontend_stmt_id, 42); // the fake backend always hands back stmt id 42

        let mut raw_execute = vec![CommandCode::ComStmtExecute as u8];
        raw_execute.extend_from_slice(&frontend_stmt_id.to_le_bytes());
        raw_execute.push(0); // cursor flag
        raw_execute.extend_from_slice(&1u32.to_le_bytes()); // iteration count

        let (mut exec_writer, mut exec_reader) = client_pipe();
        handle_execute(&mut session, &raw_execute, &mut exec_writer)
            .await
            .unwrap();
        exec_reader.next_async().await.unwrap().unwrap();

        let entries = logged(&log);
        assert!(entries.iter().any(|(tag, msg)| *tag == "replica" && msg.starts_with("PREPARE")));
        assert!(entries
            .iter()
            .any(|(tag, msg)| *tag == "replica" && msg == "EXECUTE 42"));
    }

    // 7. STMT_EXECUTE against an unknown statement id fails with
    //    ER_UNKNOWN_STMT_HANDLER.
    #[tokio::test]
    async fn execute_on_unknown_statement_fails() {
        let mut session = new_session();
        let (mut writer, mut reader) = client_pipe();

        let mut raw = vec![CommandCode::ComStmtExecute as u8];
        raw.extend_from_slice(&999u32.to_le_bytes());
        raw.push(0);
        raw.extend_from_slice(&1u32.to_le_bytes());

        handle_execute(&mut session, &raw, &mut writer).await.unwrap();
        let (_, reply) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(
            err_code(reply.as_ref()),
            ErrorKind::ER_UNKNOWN_STMT_HANDLER as u16
        );
    }

    // 8. STMT_CLOSE followed by STMT_EXECUTE on the same id fails the same
    //    way — close is not idempotent about the id staying usable.
    #[tokio::test]
    async fn execute_after_close_fails_with_unknown_statement_handler() {
        let log = new_log();
        let mut session = bound_session(&log).await;

        let (mut prep_writer, mut prep_reader) = client_pipe();
        handle_prepare(&mut session, &PrefixClassifier, b"SELECT ? FROM t", &mut prep_writer)
            .await
            .unwrap();
        let (_, header) = prep_reader.next_async().await.unwrap().unwrap();
        let frontend_stmt_id = u32::from_le_bytes([
            header.as_ref()[1],
            header.as_ref()[2],
            header.as_ref()[3],
            header.as_ref()[4],
        ]);

        handle_close(&mut session, frontend_stmt_id).await;

        let mut raw_execute = vec![CommandCode::ComStmtExecute as u8];
        raw_execute.extend_from_slice(&frontend_stmt_id.to_le_bytes());
        raw_execute.push(0);
        raw_execute.extend_from_slice(&1u32.to_le_bytes());

        let (mut exec_writer, mut exec_reader) = client_pipe();
        handle_execute(&mut session, &raw_execute, &mut exec_writer)
            .await
            .unwrap();
        let (_, reply) = exec_reader.next_async().await.unwrap().unwrap();
        assert_eq!(
            err_code(reply.as_ref()),
            ErrorKind::ER_UNKNOWN_STMT_HANDLER as u16
        );
    }

    // Regression: a nonzero cursor flag is rejected before any registry
    // lookup, independent of whether the session is bound.
    #[tokio::test]
    async fn nonzero_cursor_flag_is_rejected() {
        let mut session = new_session();
        let (mut writer, mut reader) = client_pipe();

        let mut raw = vec![CommandCode::ComStmtExecute as u8];
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.push(1); // cursor flag != 0
        raw.extend_from_slice(&1u32.to_le_bytes());

        handle_execute(&mut session, &raw, &mut writer).await.unwrap();
        let (_, reply) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(err_code(reply.as_ref()), ErrorKind::ER_UNKNOWN_ERROR as u16);
    }

    // Regression for the dead-code fix: a short COM_STMT_EXECUTE payload is
    // caught by `run`'s early length gate (`spec.md` §4.7/§7) and reported as
    // ER_MALFORMED_PACKET, never falling through to the generic
    // "command not supported" arm.
    #[tokio::test]
    async fn short_stmt_execute_payload_is_malformed_not_unsupported() {
        let mut session = new_session();
        let (client_half, driver_half) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_half);
        let mut client_reader = PacketReader::new(client_read);
        let mut client_writer = PacketWriter::new(client_write);

        let (driver_read, driver_write) = tokio::io::split(driver_half);
        let mut driver_reader = PacketReader::new(driver_read);
        let mut driver_writer = PacketWriter::new(driver_write);

        let driver = tokio::spawn(async move {
            driver_writer.reset_seq();
            driver_writer.write_all(&[CommandCode::ComStmtExecute as u8, 1, 2]).unwrap();
            driver_writer.end_packet().await.unwrap();
            driver_writer.flush_all().await.unwrap();
            let (_, reply) = driver_reader.next_async().await.unwrap().unwrap();
            drop(driver_writer);
            reply.as_ref().to_vec()
        });

        let resolver = StaticClusterResolver::new(vec![]);
        run(&mut session, &mut client_reader, &mut client_writer, &resolver, &PrefixClassifier)
            .await
            .ok();

        let reply = driver.await.unwrap();
        assert_eq!(err_code(&reply), ErrorKind::ER_MALFORMED_PACKET as u16);
    }
}
