//! Driver decorator that reports every operation as a `tracing` event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sqlwire_core::{Error, Result, Row, Value};

use crate::cancel::CancelHandle;
use crate::config::MySqlConfig;
use crate::driver::{Driver, NativeDriver, PreparedStatement, ResultSet};
use crate::protocol::ServerStatus;

/// Longest SQL prefix included in events.
const MAX_SQL_LEN: usize = 300;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps a [`Driver`] and emits `info` events before and after each
/// operation.
#[derive(Debug)]
pub struct TracingDriver<D: Driver> {
    inner: D,
    id: u64,
}

impl<D: Driver> TracingDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Process-unique id carried as `driver_id` on every event.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn finish<T>(&self, op: &'static str, started: Instant, result: Result<T>) -> Result<T> {
        let elapsed_us = started.elapsed().as_micros() as u64;
        match &result {
            Ok(_) => tracing::info!(driver_id = self.id, op, elapsed_us, "finished"),
            Err(err) => self.failed(op, err),
        }
        result
    }

    fn failed(&self, op: &'static str, err: &Error) {
        tracing::info!(
            driver_id = self.id,
            op,
            error_code = err.server_code(),
            error = %err,
            "failed"
        );
    }

    fn finish_result(
        &self,
        op: &'static str,
        started: Instant,
        statement_id: Option<u32>,
        result: Result<ResultSet>,
    ) -> Result<ResultSet> {
        match &result {
            Ok(rs) => tracing::info!(
                driver_id = self.id,
                op,
                statement_id,
                field_count = rs.field_count(),
                affected_rows = rs.affected_rows,
                insert_id = rs.last_insert_id,
                elapsed_us = started.elapsed().as_micros() as u64,
                "finished"
            ),
            Err(err) => self.failed(op, err),
        }
        result
    }
}

/// Cut `sql` to at most [`MAX_SQL_LEN`] characters.
fn truncate_sql(sql: &str) -> &str {
    match sql.char_indices().nth(MAX_SQL_LEN) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

impl<D: Driver> Driver for TracingDriver<D> {
    fn open(&mut self) -> Result<()> {
        tracing::info!(driver_id = self.id, "open");
        let started = Instant::now();
        let result = self.inner.open();
        if result.is_ok() {
            tracing::info!(
                driver_id = self.id,
                thread_id = self.inner.thread_id(),
                server_version = %self.inner.server_version(),
                "opened"
            );
        }
        self.finish("open", started, result)
    }

    fn close(&mut self) {
        tracing::info!(driver_id = self.id, thread_id = self.inner.thread_id(), "close");
        self.inner.close();
    }

    fn thread_id(&self) -> u32 {
        self.inner.thread_id()
    }

    fn server_version(&self) -> &str {
        self.inner.server_version()
    }

    fn capabilities(&self) -> u32 {
        self.inner.capabilities()
    }

    fn status(&self) -> ServerStatus {
        self.inner.status()
    }

    fn is_broken(&self) -> bool {
        self.inner.is_broken()
    }

    fn is_password_expired(&self) -> bool {
        self.inner.is_password_expired()
    }

    fn created_at(&self) -> Instant {
        self.inner.created_at()
    }

    fn reset_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner.reset_timeout(timeout)
    }

    fn query(&mut self, sql: &str) -> Result<ResultSet> {
        tracing::info!(driver_id = self.id, sql = truncate_sql(sql), "query");
        let started = Instant::now();
        let result = self.inner.query(sql);
        self.finish_result("query", started, None, result)
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let result = self.inner.next_row();
        if let Err(err) = &result {
            self.failed("next_row", err);
        }
        result
    }

    fn next_result(&mut self) -> Result<Option<ResultSet>> {
        tracing::info!(driver_id = self.id, "next_result");
        let started = Instant::now();
        match self.inner.next_result() {
            Ok(Some(rs)) => self
                .finish_result("next_result", started, None, Ok(rs))
                .map(Some),
            other => self.finish("next_result", started, other),
        }
    }

    fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        tracing::info!(driver_id = self.id, sql = truncate_sql(sql), "prepare");
        let started = Instant::now();
        let result = self.inner.prepare(sql);
        if let Ok(stmt) = &result {
            tracing::info!(
                driver_id = self.id,
                statement_id = stmt.id,
                params = stmt.param_count(),
                field_count = stmt.columns().len(),
                "prepared"
            );
        }
        self.finish("prepare", started, result)
    }

    fn execute(
        &mut self,
        statement: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        tracing::info!(
            driver_id = self.id,
            statement_id = statement.id,
            sql = truncate_sql(&statement.sql),
            params = params.len(),
            "execute"
        );
        let started = Instant::now();
        let id = statement.id;
        let result = self.inner.execute(statement, params);
        self.finish_result("execute", started, Some(id), result)
    }

    fn fetch(&mut self, statement: &PreparedStatement, rows: u32) -> Result<ResultSet> {
        tracing::info!(driver_id = self.id, statement_id = statement.id, rows, "fetch");
        let started = Instant::now();
        let result = self.inner.fetch(statement, rows);
        self.finish_result("fetch", started, Some(statement.id), result)
    }

    fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        tracing::info!(driver_id = self.id, statement_id, "close_statement");
        let started = Instant::now();
        let result = self.inner.close_statement(statement_id);
        self.finish("close_statement", started, result)
    }

    fn reset_statement(&mut self, statement_id: u32) -> Result<()> {
        tracing::info!(driver_id = self.id, statement_id, "reset_statement");
        let started = Instant::now();
        let result = self.inner.reset_statement(statement_id);
        self.finish("reset_statement", started, result)
    }

    fn ping(&mut self) -> Result<()> {
        tracing::info!(driver_id = self.id, "ping");
        let started = Instant::now();
        let result = self.inner.ping();
        self.finish("ping", started, result)
    }

    fn set_database(&mut self, database: &str) -> Result<()> {
        tracing::info!(driver_id = self.id, database, "set_database");
        let started = Instant::now();
        let result = self.inner.set_database(database);
        self.finish("set_database", started, result)
    }

    fn reset(&mut self) -> Result<()> {
        tracing::info!(driver_id = self.id, "reset");
        let started = Instant::now();
        let result = self.inner.reset();
        self.finish("reset", started, result)
    }

    fn change_user(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        tracing::info!(driver_id = self.id, user, database, "change_user");
        let started = Instant::now();
        let result = self.inner.change_user(user, password, database);
        self.finish("change_user", started, result)
    }

    fn quit(&mut self) {
        tracing::info!(driver_id = self.id, "quit");
        self.inner.quit();
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel_handle()
    }
}

/// Build and open a driver, wrapped in [`TracingDriver`] when
/// `config.tracing` is set.
pub fn open_driver(config: MySqlConfig) -> Result<Box<dyn Driver>> {
    let mut driver = new_driver(config, None);
    driver.open()?;
    Ok(driver)
}

/// Unopened driver of the variant `config.tracing` selects.
pub(crate) fn new_driver(
    config: MySqlConfig,
    buffers: Option<std::sync::Arc<crate::compress::BufferPool>>,
) -> Box<dyn Driver> {
    let tracing = config.tracing;
    let native = match buffers {
        Some(buffers) => NativeDriver::with_buffers(config, buffers),
        None => NativeDriver::new(config),
    };
    if tracing {
        Box::new(TracingDriver::new(native))
    } else {
        Box::new(native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{Script, open_scripted, test_config};
    use crate::handshake::tests::SERVER_CAPS;
    use crate::protocol::{capabilities, server_status};

    #[test]
    fn test_truncate_sql() {
        let long = "x".repeat(400);
        assert_eq!(truncate_sql(&long).len(), MAX_SQL_LEN);
        assert_eq!(truncate_sql("SELECT 1"), "SELECT 1");
        let wide = "é".repeat(301);
        assert_eq!(truncate_sql(&wide).chars().count(), MAX_SQL_LEN);
    }

    #[test]
    fn test_driver_ids_are_unique() {
        let a = TracingDriver::new(NativeDriver::new(test_config()));
        let b = TracingDriver::new(NativeDriver::new(test_config()));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_tracing_driver_delegates() {
        let mut script = Script::login(SERVER_CAPS & !capabilities::CLIENT_COMPRESS);
        script
            .command()
            .ok(4, 0, server_status::SERVER_STATUS_AUTOCOMMIT)
            .command()
            .err(1146, "42S02", "Table 'test.nope' doesn't exist");
        let (native, _, result) = open_scripted(test_config(), &script);
        result.unwrap();

        let mut driver = TracingDriver::new(native);
        assert_eq!(driver.thread_id(), 42);
        let rs = driver.query("DELETE FROM t").unwrap();
        assert_eq!(rs.affected_rows, 4);

        let err = driver.query("SELECT * FROM nope").unwrap_err();
        assert_eq!(err.server_code(), Some(1146));
        assert!(!driver.is_broken());
    }

    #[test]
    fn test_new_driver_picks_variant() {
        let plain = new_driver(test_config(), None);
        assert!(plain.is_broken());
        let traced = new_driver(test_config().tracing(true), None);
        assert!(traced.is_broken());
        assert_eq!(traced.thread_id(), 0);
    }
}
