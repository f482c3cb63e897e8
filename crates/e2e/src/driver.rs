//! Browser automation seam
//!
//! Scenario code talks to the browser only through [`BrowserDriver`], so a
//! scripted fake can stand in for a real browser in tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;

pub type DriverResult<T> = Result<T, DriverError>;

/// The page operations a scenario needs
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> DriverResult<()>;

    /// Wait until `selector` is visible
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> DriverResult<()>;

    async fn move_pointer(&mut self, x: f64, y: f64) -> DriverResult<()>;

    /// Press one character after waiting `delay`
    async fn type_char(&mut self, ch: char, delay: Duration) -> DriverResult<()>;

    /// Focus an element without moving the pointer
    async fn focus(&mut self, selector: &str) -> DriverResult<()>;

    async fn click(&mut self, selector: &str) -> DriverResult<()>;

    /// Text content of the first match; empty when it has none
    async fn read_text(&mut self, selector: &str) -> DriverResult<String>;

    async fn read_attribute(&mut self, selector: &str, name: &str) -> DriverResult<Option<String>>;

    async fn screenshot(&mut self, path: &Path) -> DriverResult<()>;

    /// End the browser session. Further calls fail.
    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens a fresh, isolated browser session
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self) -> DriverResult<Box<dyn BrowserDriver>>;
}
