//! Read/write routing predicate and master/replica backend pinning.
//! Grounded on `original_source/proxy/dispatch.go`'s `Session.dispatch`/
//! `Session.IsAutoCommit` and the transaction-pinning invariant from
//! `spec.md` §4.2/§5.

use crate::session::classifier::Statement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Master,
    Replica,
}

/// `is_read(stmt, session)` from `spec.md` §4.2: true iff the statement is an
/// unlocked Select and the session is outside any transaction with
/// autocommit on.
pub fn is_read(stmt: &Statement, in_transaction: bool, autocommit: bool) -> bool {
    matches!(stmt, Statement::Select { locked: false }) && !in_transaction && autocommit
}

/// The router never switches backends mid-transaction: once pinned to master
/// at transaction start, every statement until commit/rollback uses the same
/// handle (`spec.md` §4.2, §8 "Transaction pinning").
pub fn route(stmt: &Statement, in_transaction: bool, autocommit: bool) -> RouteTarget {
    if is_read(stmt, in_transaction, autocommit) {
        RouteTarget::Replica
    } else {
        RouteTarget::Master
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBoundary {
    Begin,
    End,
}

/// Detects `BEGIN`/`START TRANSACTION`/`COMMIT`/`ROLLBACK` so the dispatcher
/// can toggle `Session.in_transaction` — the classifier itself only tags SQL
/// shape, not transaction control (`spec.md` §3's tagged-variant list has no
/// Begin/Commit case).
pub fn transaction_boundary(sql: &str) -> Option<TxBoundary> {
    let upper = sql.trim().trim_end_matches(';').trim().to_ascii_uppercase();
    match upper.as_str() {
        "BEGIN" | "START TRANSACTION" => Some(TxBoundary::Begin),
        "COMMIT" | "ROLLBACK" => Some(TxBoundary::End),
        _ => None,
    }
}
