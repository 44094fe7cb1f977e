//! Scriptable transport for tests and simulations.
//!
//! Clones of a [`MockTransport`] share state, so a test can hand one clone to
//! an instrument and keep another to script replies and inspect traffic:
//! - call log (`open`, `write:<cmd>`, `query:<cmd>`, `close`)
//! - scripted replies per query string, with an optional fallback
//! - one-shot failure injection and a failing `open`
//! - open counter

use super::{Transport, TransportKind, TransportSettings};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct MockState {
    open: bool,
    open_count: usize,
    fail_open: bool,
    fail_next: bool,
    replies: HashMap<String, VecDeque<String>>,
    fallback: Option<String>,
    call_log: Vec<String>,
}

/// Mock transport
///
/// # Example
///
/// ```
/// use rust_hwctl::adapters::{MockTransport, Transport, TransportSettings};
///
/// # tokio_test::block_on(async {
/// let mock = MockTransport::new();
/// mock.reply("V?", "5.0");
///
/// let mut transport = mock.clone();
/// transport.open(&TransportSettings::new("mock")).await.unwrap();
/// let reply = transport.query("V?", None).await.unwrap();
/// assert_eq!(reply.as_deref(), Some("5.0"));
/// assert_eq!(mock.call_log(), vec!["open", "query:V?"]);
/// # })
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `reply` for the next query of `command`.
    ///
    /// The last queued reply for a command is repeated once the queue runs dry.
    pub fn reply(&self, command: &str, reply: &str) {
        self.state()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Reply returned for queries without a scripted reply.
    pub fn fallback_reply(&self, reply: &str) {
        self.state().fallback = Some(reply.to_string());
    }

    /// Make the next write or query fail.
    pub fn fail_next(&self) {
        self.state().fail_next = true;
    }

    /// Make every `open` fail until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    /// Get a copy of the call log for verification
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Commands sent through `write`, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state()
            .call_log
            .iter()
            .filter_map(|c| c.strip_prefix("write:").map(str::to_string))
            .collect()
    }

    /// Number of write and query calls.
    pub fn io_count(&self) -> usize {
        self.state()
            .call_log
            .iter()
            .filter(|c| c.starts_with("write:") || c.starts_with("query:"))
            .count()
    }

    /// Clear the call log
    pub fn clear_call_log(&self) {
        self.state().call_log.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::None
    }

    async fn open(&mut self, settings: &TransportSettings) -> Result<()> {
        let mut state = self.state();
        state.call_log.push("open".to_string());
        if state.fail_open {
            return Err(anyhow!("Mock connection to '{}' refused", settings.address));
        }
        state.open = true;
        state.open_count += 1;
        debug!("MockTransport opened '{}'", settings.address);
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let mut state = self.state();
        state.call_log.push(format!("write:{}", command));
        if std::mem::take(&mut state.fail_next) {
            return Err(anyhow!("Mock write failure"));
        }
        if !state.open {
            return Err(anyhow!("Mock transport is not open"));
        }
        Ok(())
    }

    async fn query(&mut self, command: &str, _delay: Option<Duration>) -> Result<Option<String>> {
        let mut state = self.state();
        state.call_log.push(format!("query:{}", command));
        if std::mem::take(&mut state.fail_next) {
            return Err(anyhow!("Mock query failure"));
        }
        if !state.open {
            return Err(anyhow!("Mock transport is not open"));
        }
        let scripted = state.replies.get_mut(command).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        scripted
            .or_else(|| state.fallback.clone())
            .map(Some)
            .ok_or_else(|| anyhow!("No scripted reply for '{}'", command))
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.call_log.push("close".to_string());
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_repeat_last() {
        let mock = MockTransport::new();
        mock.reply("V?", "1");
        mock.reply("V?", "2");
        let mut t = mock.clone();
        t.open(&TransportSettings::new("mock")).await.unwrap();
        assert_eq!(t.query("V?", None).await.unwrap().as_deref(), Some("1"));
        assert_eq!(t.query("V?", None).await.unwrap().as_deref(), Some("2"));
        assert_eq!(t.query("V?", None).await.unwrap().as_deref(), Some("2"));
        assert!(t.query("I?", None).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_is_one_shot() {
        let mock = MockTransport::new();
        let mut t = mock.clone();
        t.open(&TransportSettings::new("mock")).await.unwrap();
        mock.fail_next();
        assert!(t.write("A").await.is_err());
        assert!(t.write("B").await.is_ok());
        assert_eq!(mock.writes(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let mock = MockTransport::new();
        mock.set_fail_open(true);
        let mut t = mock.clone();
        assert!(t.open(&TransportSettings::new("mock")).await.is_err());
        assert_eq!(mock.open_count(), 0);
        assert!(!mock.is_open());
    }
}
