//! WinInet per-connection proxy options plus the user `http_proxy`
//! environment variable.

use super::SystemProxy;
use crate::error::{Error, Result};
use std::ffi::{c_void, OsStr};
use std::os::windows::ffi::OsStrExt;
use windows_sys::Win32::Networking::WinInet::{
  InternetQueryOptionW, InternetSetOptionW, INTERNET_PER_CONN_OPTIONW, INTERNET_PER_CONN_OPTIONW_0,
  INTERNET_PER_CONN_OPTION_LISTW,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
  SendMessageTimeoutW, HWND_BROADCAST, SMTO_ABORTIFHUNG, WM_SETTINGCHANGE,
};
use winreg::enums::HKEY_CURRENT_USER;
use winreg::RegKey;

const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";
const ENVIRONMENT: &str = "Environment";
const HTTP_PROXY_VAR: &str = "http_proxy";

const INTERNET_PER_CONN_FLAGS: u32 = 1;
const INTERNET_PER_CONN_PROXY_SERVER: u32 = 2;
const INTERNET_PER_CONN_PROXY_BYPASS: u32 = 3;
const INTERNET_PER_CONN_AUTOCONFIG_URL: u32 = 4;
const PROXY_TYPE_DIRECT: u32 = 1;
const PROXY_TYPE_PROXY: u32 = 2;
const PROXY_TYPE_AUTO_PROXY_URL: u32 = 4;
const PROXY_TYPE_AUTO_DETECT: u32 = 8;
const INTERNET_OPTION_PER_CONNECTION_OPTION: u32 = 75;
const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;
const INTERNET_OPTION_REFRESH: u32 = 37;
const BROADCAST_TIMEOUT_MS: u32 = 5000;

/// Values overwritten by the redirect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WinProxySnapshot {
  /// `INTERNET_PER_CONN_FLAGS` as reported by WinInet
  pub flags: Option<u32>,
  pub proxy_enable: bool,
  pub proxy_server: Option<String>,
  pub proxy_override: Option<String>,
  pub auto_config_url: Option<String>,
  pub http_proxy_env: Option<String>,
}

#[derive(Debug, Default)]
pub struct WinInetProxy;

impl SystemProxy for WinInetProxy {
  type State = WinProxySnapshot;

  fn name(&self) -> &'static str {
    "wininet"
  }

  fn capture(&self) -> Result<WinProxySnapshot> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let settings = hkcu
      .open_subkey(INTERNET_SETTINGS)
      .map_err(|e| Error::system_proxy_error(format!("open Internet Settings: {}", e)))?;
    let http_proxy_env = hkcu
      .open_subkey(ENVIRONMENT)
      .ok()
      .and_then(|env| env.get_value::<String, _>(HTTP_PROXY_VAR).ok());
    let flags = match query_per_connection_flags() {
      Ok(flags) => Some(flags),
      Err(e) => {
        tracing::warn!("[SYSPROXY] {}; restoring flags from the registry", e);
        None
      }
    };
    Ok(WinProxySnapshot {
      flags,
      proxy_enable: settings
        .get_value::<u32, _>("ProxyEnable")
        .map(|v| v != 0)
        .unwrap_or(false),
      proxy_server: settings.get_value::<String, _>("ProxyServer").ok(),
      proxy_override: settings.get_value::<String, _>("ProxyOverride").ok(),
      auto_config_url: settings.get_value::<String, _>("AutoConfigURL").ok(),
      http_proxy_env,
    })
  }

  fn apply(&self, listen: &str) -> Result<()> {
    let server = format!("http={0};https={0}", listen);
    set_per_connection(
      PROXY_TYPE_DIRECT | PROXY_TYPE_PROXY,
      Some(&server),
      Some("<local>"),
      None,
    )?;
    set_http_proxy_env(Some(&format!("http://{}", listen)))?;
    broadcast_environment_change();
    Ok(())
  }

  fn restore(&self, state: WinProxySnapshot) -> Result<()> {
    set_per_connection(
      restore_flags(&state),
      state.proxy_server.as_deref(),
      state.proxy_override.as_deref(),
      state.auto_config_url.as_deref(),
    )?;
    set_http_proxy_env(state.http_proxy_env.as_deref())?;
    broadcast_environment_change();
    Ok(())
  }
}

/// Flags to write back, preferring the captured WinInet value verbatim
fn restore_flags(state: &WinProxySnapshot) -> u32 {
  if let Some(flags) = state.flags {
    return flags;
  }
  let mut flags = PROXY_TYPE_DIRECT;
  if state.proxy_enable {
    flags |= PROXY_TYPE_PROXY;
  }
  if state.auto_config_url.is_some() {
    flags |= PROXY_TYPE_AUTO_PROXY_URL;
  }
  flags
}

fn query_per_connection_flags() -> Result<u32> {
  let mut option = INTERNET_PER_CONN_OPTIONW {
    dwOption: INTERNET_PER_CONN_FLAGS,
    Value: INTERNET_PER_CONN_OPTIONW_0 { dwValue: 0 },
  };
  let mut size = std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32;
  let mut list = INTERNET_PER_CONN_OPTION_LISTW {
    dwSize: size,
    pszConnection: std::ptr::null_mut(),
    dwOptionCount: 1,
    dwOptionError: 0,
    pOptions: &mut option,
  };
  // SAFETY: `list` points at `option`, both alive for the call.
  let ok = unsafe {
    InternetQueryOptionW(
      std::ptr::null(),
      INTERNET_OPTION_PER_CONNECTION_OPTION,
      &mut list as *mut INTERNET_PER_CONN_OPTION_LISTW as *mut c_void,
      &mut size,
    )
  };
  if ok == 0 {
    return Err(Error::system_proxy_error(format!(
      "InternetQueryOptionW failed: {}",
      std::io::Error::last_os_error()
    )));
  }
  // SAFETY: WinInet filled the dwValue arm for INTERNET_PER_CONN_FLAGS.
  Ok(unsafe { option.Value.dwValue })
}

fn wide(s: &str) -> Vec<u16> {
  OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

fn set_per_connection(
  flags: u32,
  server: Option<&str>,
  bypass: Option<&str>,
  auto_config_url: Option<&str>,
) -> Result<()> {
  let mut server = wide(server.unwrap_or(""));
  let mut bypass = wide(bypass.unwrap_or(""));
  let mut url = auto_config_url.map(wide);

  let mut options = vec![
    INTERNET_PER_CONN_OPTIONW {
      dwOption: INTERNET_PER_CONN_FLAGS,
      Value: INTERNET_PER_CONN_OPTIONW_0 { dwValue: flags },
    },
    INTERNET_PER_CONN_OPTIONW {
      dwOption: INTERNET_PER_CONN_PROXY_SERVER,
      Value: INTERNET_PER_CONN_OPTIONW_0 {
        pszValue: server.as_mut_ptr(),
      },
    },
    INTERNET_PER_CONN_OPTIONW {
      dwOption: INTERNET_PER_CONN_PROXY_BYPASS,
      Value: INTERNET_PER_CONN_OPTIONW_0 {
        pszValue: bypass.as_mut_ptr(),
      },
    },
  ];
  if let Some(url) = url.as_mut() {
    options.push(INTERNET_PER_CONN_OPTIONW {
      dwOption: INTERNET_PER_CONN_AUTOCONFIG_URL,
      Value: INTERNET_PER_CONN_OPTIONW_0 {
        pszValue: url.as_mut_ptr(),
      },
    });
  }

  let size = std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32;
  let mut list = INTERNET_PER_CONN_OPTION_LISTW {
    dwSize: size,
    pszConnection: std::ptr::null_mut(),
    dwOptionCount: options.len() as u32,
    dwOptionError: 0,
    pOptions: options.as_mut_ptr(),
  };

  // SAFETY: `list` and every buffer it points to outlive the calls.
  let ok = unsafe {
    InternetSetOptionW(
      std::ptr::null(),
      INTERNET_OPTION_PER_CONNECTION_OPTION,
      &mut list as *mut INTERNET_PER_CONN_OPTION_LISTW as *const c_void,
      size,
    )
  };
  if ok == 0 {
    return Err(Error::system_proxy_error(format!(
      "InternetSetOptionW failed: {}",
      std::io::Error::last_os_error()
    )));
  }
  unsafe {
    InternetSetOptionW(
      std::ptr::null(),
      INTERNET_OPTION_SETTINGS_CHANGED,
      std::ptr::null(),
      0,
    );
    InternetSetOptionW(std::ptr::null(), INTERNET_OPTION_REFRESH, std::ptr::null(), 0);
  }
  Ok(())
}

fn set_http_proxy_env(value: Option<&str>) -> Result<()> {
  let hkcu = RegKey::predef(HKEY_CURRENT_USER);
  let (env, _) = hkcu
    .create_subkey(ENVIRONMENT)
    .map_err(|e| Error::system_proxy_error(format!("open Environment: {}", e)))?;
  match value {
    Some(value) => env
      .set_value(HTTP_PROXY_VAR, &value.to_string())
      .map_err(|e| Error::system_proxy_error(format!("set {}: {}", HTTP_PROXY_VAR, e))),
    None => match env.delete_value(HTTP_PROXY_VAR) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(Error::system_proxy_error(format!(
        "delete {}: {}",
        HTTP_PROXY_VAR, e
      ))),
    },
  }
}

/// Best effort; processes that ignore WM_SETTINGCHANGE keep their old value.
fn broadcast_environment_change() {
  let param = wide(ENVIRONMENT);
  let mut result: usize = 0;
  // SAFETY: `param` is a NUL-terminated UTF-16 string alive for the call.
  let sent = unsafe {
    SendMessageTimeoutW(
      HWND_BROADCAST,
      WM_SETTINGCHANGE,
      0,
      param.as_ptr() as isize,
      SMTO_ABORTIFHUNG,
      BROADCAST_TIMEOUT_MS,
      &mut result,
    )
  };
  if sent == 0 {
    tracing::warn!("[SYSPROXY] WM_SETTINGCHANGE broadcast timed out");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn captured_flags_are_restored_verbatim() {
    let state = WinProxySnapshot {
      flags: Some(PROXY_TYPE_DIRECT | PROXY_TYPE_AUTO_DETECT),
      ..Default::default()
    };
    assert_eq!(restore_flags(&state), 0x9);
  }

  #[test]
  fn registry_fallback_derives_flags() {
    let state = WinProxySnapshot {
      proxy_enable: true,
      auto_config_url: Some("http://wpad/wpad.dat".into()),
      ..Default::default()
    };
    assert_eq!(
      restore_flags(&state),
      PROXY_TYPE_DIRECT | PROXY_TYPE_PROXY | PROXY_TYPE_AUTO_PROXY_URL
    );
  }
}
