//! Name-keyed handler table for inbound messages and lifecycle events.

use {
    crate::packet::Message,
    core::fmt,
    std::collections::HashMap,
    tracing::debug,
};

/// Lifecycle event dispatched by a [`Connection`].
///
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMessage {
    /// The transport finished connecting.
    Open,
    /// The transport disconnected or failed.
    Close,
    /// The peer intentionally ended the session.
    Exit,
}

type MessageHandler = Box<dyn FnMut(&[&str])>;
type SystemHandler = Box<dyn FnMut()>;
type RawHandler = Box<dyn FnMut(&str, &str)>;

/// Handlers invoked by a [`Connection`] from its `poll` method.
///
/// Each name or [`SystemMessage`] has at most one handler; registering
/// another replaces the previous one.
///
/// [`Connection`]: crate::connection::Connection
#[derive(Default)]
pub struct Handlers {
    messages: HashMap<String, MessageHandler>,
    system: HashMap<SystemMessage, SystemHandler>,
    raw: Option<RawHandler>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("messages", &self.messages.keys().collect::<Vec<_>>())
            .field("system", &self.system.keys().collect::<Vec<_>>())
            .field("raw", &self.raw.is_some())
            .finish()
    }
}

impl Handlers {
    /// Registers the handler for messages named `name`.
    pub fn on_message(&mut self, name: impl Into<String>, f: impl FnMut(&[&str]) + 'static) {
        self.messages.insert(name.into(), Box::new(f));
    }

    /// Registers the handler for a lifecycle event.
    pub fn on_system(&mut self, msg: SystemMessage, f: impl FnMut() + 'static) {
        self.system.insert(msg, Box::new(f));
    }

    /// Registers a handler receiving every message which has no named
    /// handler, as its name and unsplit parameter string.
    pub fn on_raw(&mut self, f: impl FnMut(&str, &str) + 'static) {
        self.raw = Some(Box::new(f));
    }

    pub(crate) fn dispatch_system(&mut self, msg: SystemMessage) {
        if let Some(handler) = self.system.get_mut(&msg) {
            handler();
        }
    }

    pub(crate) fn dispatch_message(&mut self, msg: &Message<'_>) {
        if let Some(handler) = self.messages.get_mut(msg.name) {
            handler(&msg.params);
        } else if let Some(raw) = &mut self.raw {
            raw(msg.name, msg.raw_params);
        } else {
            debug!("No handler for message `{}`", msg.name);
        }
    }
}
