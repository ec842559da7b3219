//! Dispatch of protocol upgrades.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::http::connection::{HttpHandler, Request, StatusHandler};
use crate::http::writer::ResponseWriter;

/// Routes upgrade handshakes by the protocol named in the `Upgrade`
/// header.
///
/// A handler registered under `*` catches protocols with no handler of
/// their own. Handlers are expected to write a `101 Switching Protocols`
/// response, flush, hijack the connection, and serve the new protocol
/// before returning.
#[derive(Default)]
pub struct UpgradeMux {
    handlers: RwLock<HashMap<String, Arc<dyn HttpHandler>>>,
}

impl UpgradeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for the protocol `name`.
    ///
    /// Registering the same name twice is a programming error and panics.
    pub fn handle(&self, name: &str, handler: Arc<dyn HttpHandler>) {
        let key = if name == "*" {
            String::new()
        } else {
            name.to_ascii_lowercase()
        };

        let mut handlers = self.handlers.write().expect("upgrade table poisoned");
        if handlers.contains_key(&key) {
            panic!("an upgrade handler already exists for {name}");
        }
        handlers.insert(key, handler);
    }

    /// The handler serving `req`'s upgrade, if the request is an upgrade
    /// handshake at all.
    pub fn handler(&self, req: &Request<'_>) -> Option<Arc<dyn HttpHandler>> {
        let name = req.head.upgrade()?.to_ascii_lowercase();
        let handlers = self.handlers.read().expect("upgrade table poisoned");
        handlers
            .get(&name)
            .or_else(|| handlers.get(""))
            .map(Arc::clone)
    }
}

#[async_trait]
impl HttpHandler for UpgradeMux {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        req: &mut Request<'_>,
    ) -> anyhow::Result<()> {
        match self.handler(req) {
            Some(handler) => handler.serve_http(res, req).await,
            None => StatusHandler(501).serve_http(res, req).await,
        }
    }
}
