use rusqlite::Connection;

/// Apply PRAGMA tuning shared by both the app database and every per-project
/// database: WAL journaling, relaxed synchronous mode (safe under WAL),
/// a modest page cache, and a bounded busy timeout so concurrent readers
/// never hard-fail on a writer holding the lock briefly.
pub fn apply_pragmas(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -20000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Run each statement in `statements` against `conn`, ignoring the "already
/// exists" / "duplicate column" class of error so that additive migrations
/// are safe to re-run on every startup. Migrations are forward-only: there
/// is no down-migration path, matching the persisted-state contract that
/// schema evolution is additive except for the one documented widening of
/// the PrReviewFix uniqueness constraint (handled explicitly, not via this
/// generic runner).
pub fn run_idempotent(conn: &Connection, statements: &[&str]) -> rusqlite::Result<()> {
    for stmt in statements {
        match conn.execute_batch(stmt) {
            Ok(()) => {}
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("already exists") || msg.contains("duplicate column") {
                    continue;
                }
                return Err(e);
            }
        }
    }
    Ok(())
}
