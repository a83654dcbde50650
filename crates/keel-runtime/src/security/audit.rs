//! Audit trail of foreign call permission checks

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Security audit event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// A foreign call passed the capability gate
    ForeignCallGranted { library: String, symbol: String },
    /// A foreign call was refused before marshalling
    ForeignCallDenied { library: String, symbol: String },
    /// A grant was added to a security context
    GrantAdded { grant: String },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::ForeignCallGranted { library, symbol } => {
                write!(f, "Permission GRANTED: foreign call {}::{}", library, symbol)
            }
            AuditEvent::ForeignCallDenied { library, symbol } => {
                write!(f, "Permission DENIED: foreign call {}::{}", library, symbol)
            }
            AuditEvent::GrantAdded { grant } => write!(f, "Grant added: {}", grant),
        }
    }
}

/// Audit log entry with timestamp
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: current_timestamp_ms(),
            event,
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        format!(
            "[{}+{:03}ms] {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.event
        )
    }
}

fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Audit logger trait for customizable logging backends
pub trait AuditLogger: Send + Sync {
    fn log(&self, event: AuditEvent);

    /// All logged entries (for testing)
    fn entries(&self) -> Vec<AuditEntry>;

    fn clear(&self);
}

/// In-memory audit logger
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        // A panicking logger thread leaves the entries intact
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.lock().push(AuditEntry::new(event));
    }

    fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Null audit logger (no-op)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditLogger;

impl NullAuditLogger {
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    fn entries(&self) -> Vec<AuditEntry> {
        Vec::new()
    }

    fn clear(&self) {}
}
