use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tether_core::{Clock, SystemClock};

use crate::native::BroadcastHub;
use crate::storage::StorageDocument;

/// Kind of execution context a channel lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// A browsing context with a document.
    Window,
    /// A worker reachable from browsing contexts.
    Worker,
    /// A headless host context with no browsing-context APIs.
    Background,
}

/// Capabilities available to one execution context.
///
/// Contexts that should see each other share the same hub, database file, and
/// storage area; each context gets its own `StorageDocument`.
#[derive(Clone)]
pub struct Platform {
    pub context: ContextKind,
    pub clock: Arc<dyn Clock>,
    pub native: Option<Arc<BroadcastHub>>,
    pub store_path: Option<PathBuf>,
    pub storage: Option<StorageDocument>,
}

impl Platform {
    /// A window context with no transport capabilities yet.
    pub fn window() -> Self {
        Self {
            context: ContextKind::Window,
            clock: Arc::new(SystemClock),
            native: None,
            store_path: None,
            storage: None,
        }
    }

    pub fn with_context(mut self, context: ContextKind) -> Self {
        self.context = context;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_native(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.native = Some(hub);
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_storage(mut self, document: StorageDocument) -> Self {
        self.storage = Some(document);
        self
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("context", &self.context)
            .field("native", &self.native.is_some())
            .field("store_path", &self.store_path)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}
