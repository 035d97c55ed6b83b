//! Sync client configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Client-wide options
// ============================================================================

/// Where the client keeps its metadata realm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataMode {
  #[default]
  Plaintext,
  Encrypted,
  Disabled,
}

/// Reconnect backoff behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
  /// Full exponential backoff
  #[default]
  Normal,
  /// Immediate reconnects, for tests only
  Testing,
}

/// Options shared by every session of one sync client
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
  pub base_file_path: PathBuf,
  pub metadata_mode: MetadataMode,
  pub custom_encryption_key: Option<[u8; 64]>,
  pub reconnect_mode: ReconnectMode,
  /// Allow multiple sessions to share one connection
  pub multiplex_sessions: bool,
  pub user_agent_binding_info: String,
  pub user_agent_application_info: String,
  pub connect_timeout: Duration,
  pub connection_linger_time: Duration,
  pub ping_keepalive_period: Duration,
  pub pong_keepalive_timeout: Duration,
  pub fast_reconnect_limit: Duration,
}

impl Default for SyncClientConfig {
  fn default() -> Self {
    Self {
      base_file_path: PathBuf::new(),
      metadata_mode: MetadataMode::default(),
      custom_encryption_key: None,
      reconnect_mode: ReconnectMode::default(),
      multiplex_sessions: false,
      user_agent_binding_info: String::new(),
      user_agent_application_info: String::new(),
      connect_timeout: Duration::from_secs(120),
      connection_linger_time: Duration::from_secs(30),
      ping_keepalive_period: Duration::from_secs(60),
      pong_keepalive_timeout: Duration::from_secs(120),
      fast_reconnect_limit: Duration::from_secs(60),
    }
  }
}

// ============================================================================
// Per-session options
// ============================================================================

/// When a session stops after its realm closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStopPolicy {
  Immediately,
  LiveIndefinitely,
  #[default]
  AfterChangesUploaded,
}

/// How the client responds to a server-initiated reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientResyncMode {
  /// Surface the failure and stop
  Manual,
  /// Replace local state with the fresh server copy
  DiscardLocal,
  /// Replay local offline changes onto the fresh server copy
  #[default]
  Recover,
  /// Recover, falling back to DiscardLocal when recovery is denied
  RecoverOrDiscard,
}

impl std::fmt::Display for ClientResyncMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ClientResyncMode::Manual => "Manual",
      ClientResyncMode::DiscardLocal => "DiscardLocal",
      ClientResyncMode::Recover => "Recover",
      ClientResyncMode::RecoverOrDiscard => "RecoverOrDiscard",
    };
    f.write_str(name)
  }
}

/// Per-realm sync options
#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Server-side partition; empty for flexible sync
  pub partition_value: String,
  /// Flexible sync (subscription-based) requested
  pub flx_sync_requested: bool,
  pub user_id: String,
  pub stop_policy: SessionStopPolicy,
  pub resync_mode: ClientResyncMode,
  pub client_validate_ssl: bool,
  pub ssl_trust_certificate_path: Option<PathBuf>,
  pub authorization_header_name: Option<String>,
  pub custom_http_headers: HashMap<String, String>,
  /// Where pre-reset state is parked during a client reset
  pub recovery_directory: Option<PathBuf>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      partition_value: String::new(),
      flx_sync_requested: false,
      user_id: String::new(),
      stop_policy: SessionStopPolicy::default(),
      resync_mode: ClientResyncMode::default(),
      client_validate_ssl: true,
      ssl_trust_certificate_path: None,
      authorization_header_name: None,
      custom_http_headers: HashMap::new(),
      recovery_directory: None,
    }
  }
}

impl SyncConfig {
  /// Configs are compatible when their identity-defining parts agree
  pub fn matches(&self, other: &SyncConfig) -> bool {
    self.partition_value == other.partition_value
      && self.flx_sync_requested == other.flx_sync_requested
      && self.user_id == other.user_id
  }
}
