use super::SystemProxy;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Backend that keeps the "system" proxy setting in memory
#[derive(Debug, Default)]
pub struct MemorySystemProxy {
  setting: Mutex<Option<String>>,
  fail_apply: bool,
  applies: AtomicUsize,
  restores: AtomicUsize,
}

impl MemorySystemProxy {
  /// Start with the given pre-existing proxy setting
  pub fn with_setting(setting: Option<String>) -> Self {
    Self {
      setting: Mutex::new(setting),
      ..Default::default()
    }
  }

  /// Overwrite the setting and then fail, like a backend that dies halfway
  pub fn failing_apply(mut self) -> Self {
    self.fail_apply = true;
    self
  }

  /// Current proxy setting
  pub fn current(&self) -> Option<String> {
    self.setting.lock().ok().and_then(|s| s.clone())
  }

  pub fn apply_count(&self) -> usize {
    self.applies.load(Ordering::SeqCst)
  }

  pub fn restore_count(&self) -> usize {
    self.restores.load(Ordering::SeqCst)
  }
}

impl SystemProxy for MemorySystemProxy {
  type State = Option<String>;

  fn name(&self) -> &'static str {
    "memory"
  }

  fn capture(&self) -> Result<Option<String>> {
    Ok(self.current())
  }

  fn apply(&self, listen: &str) -> Result<()> {
    self.applies.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut setting) = self.setting.lock() {
      *setting = Some(listen.to_string());
    }
    if self.fail_apply {
      return Err(Error::system_proxy_error("apply rejected"));
    }
    Ok(())
  }

  fn restore(&self, state: Option<String>) -> Result<()> {
    self.restores.fetch_add(1, Ordering::SeqCst);
    let mut setting = self
      .setting
      .lock()
      .map_err(|_| Error::system_proxy_error("setting lock poisoned"))?;
    *setting = state;
    Ok(())
  }
}
