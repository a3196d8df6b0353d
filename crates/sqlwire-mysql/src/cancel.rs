//! Out-of-band query cancellation.
//!
//! MySQL has no in-band cancel: a second, short-lived session issues
//! `KILL QUERY <thread id>` against the session running the statement.

use sqlwire_core::Result;

use crate::config::MySqlConfig;
use crate::driver::{Driver, NativeDriver};

/// Kill the statement running on `thread_id`.
///
/// Opens a fresh unpooled session bounded by `cancel_timeout`; the
/// session is closed before returning.
pub fn cancel_query(config: &MySqlConfig, thread_id: u32) -> Result<()> {
    let mut cancel_config = config
        .clone()
        .pooling(false)
        .tracing(false)
        .connect_timeout(config.cancel_timeout)
        .command_timeout(Some(config.cancel_timeout));
    cancel_config.local_infile = false;

    let mut driver = NativeDriver::new(cancel_config);
    driver.open()?;
    let result = driver.query(&format!("KILL QUERY {thread_id}")).map(drop);
    driver.close();

    match &result {
        Ok(()) => tracing::info!(thread_id, "query cancelled"),
        Err(err) => tracing::warn!(thread_id, error = %err, "KILL QUERY failed"),
    }
    result
}

/// Cancels whatever statement a driver is running, from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    config: MySqlConfig,
    thread_id: u32,
}

impl CancelHandle {
    pub fn new(config: MySqlConfig, thread_id: u32) -> Self {
        Self { config, thread_id }
    }

    /// Server connection id this handle targets.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn cancel(&self) -> Result<()> {
        cancel_query(&self.config, self.thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_cancel_handle_is_send_sync() {
        assert_send_sync::<CancelHandle>();
    }

    #[test]
    fn test_cancel_unreachable_server_is_bounded() {
        // Reserved TEST-NET-1 address: the connect attempt times out.
        let config = MySqlConfig::new()
            .host("192.0.2.1")
            .port(3306)
            .cancel_timeout(Duration::from_millis(200));
        let handle = CancelHandle::new(config, 17);
        assert_eq!(handle.thread_id(), 17);

        let start = Instant::now();
        assert!(handle.cancel().is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
