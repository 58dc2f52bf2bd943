// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Hierarchical, component-scoped error recording.
//!
//! Components form a tree rooted at `core`. Errors are raised against a
//! component, handled by that component's handlers on the raising thread,
//! and routed along parent/child edges according to each handler
//! registration's propagation mode. An error that reaches the root
//! unhandled trips the core's fatal policy when its severity is Fatal;
//! lower severities travel back to the caller through the enclosing
//! operation's error channel.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use babel_shared::component::{ComponentState, IsolationLevel, PropagationMode, SecurityContext};
use babel_shared::error::{ErrorCode, Severity};
use babel_shared::event::TraceEvent;
use babel_shared::ident::Identifier;

use crate::call_error;
use crate::errors::Result;
use crate::externs::Externs;

/// Name of the root component.
pub const ROOT_COMPONENT: &str = "core";

/// One recorded error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub component: String,
    /// Free-form source category (subsystem, host language, peripheral).
    pub source: String,
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(
        component: impl Into<String>,
        source: impl Into<String>,
        code: ErrorCode,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        ErrorEntry {
            component: component.into(),
            source: source.into(),
            code,
            severity,
            message: message.into(),
        }
    }
}

/// What became of a raised error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Some handler marked the error handled.
    Handled,
    /// No handler claimed it; the caller surfaces it.
    Unhandled,
    /// Unhandled and Fatal at the root: the embedder should treat the core
    /// as lost.
    FatalUnhandled,
}

/// A handler observes an entry and says whether it handled it. Handlers
/// run synchronously on the raising thread and must not raise themselves;
/// one that does is logged and treated as a no-op.
pub type Handler = Arc<dyn Fn(&ErrorEntry) -> bool + Send + Sync>;

struct ComponentNode {
    parent: Option<String>,
    children: Vec<String>,
    state: ComponentState,
    isolation: IsolationLevel,
    security: SecurityContext,
    default_mode: PropagationMode,
    handlers: Vec<(PropagationMode, Handler)>,
}

impl ComponentNode {
    fn new(parent: Option<String>, isolation: IsolationLevel) -> Self {
        ComponentNode {
            parent,
            children: Vec::new(),
            state: ComponentState::Init,
            isolation,
            security: SecurityContext::default(),
            default_mode: PropagationMode::None,
            handlers: Vec::new(),
        }
    }
}

/// The component tree and its error routing.
pub struct ErrorSystem {
    nodes: RwLock<HashMap<String, ComponentNode>>,
    /// Configured default propagation modes, kept for components that
    /// register after configuration is applied.
    defaults: RwLock<HashMap<String, PropagationMode>>,
    /// Everything at severity Warning and above, for the shutdown-time
    /// aggregation point.
    journal: Mutex<Vec<ErrorEntry>>,
    core_fatal: AtomicBool,
    externs: Arc<dyn Externs>,
}

impl ErrorSystem {
    pub fn new(externs: Arc<dyn Externs>) -> Self {
        let mut nodes = HashMap::new();
        let mut root = ComponentNode::new(None, IsolationLevel::None);
        root.state = ComponentState::Ready;
        nodes.insert(ROOT_COMPONENT.to_owned(), root);
        ErrorSystem {
            nodes: RwLock::new(nodes),
            defaults: RwLock::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            core_fatal: AtomicBool::new(false),
            externs,
        }
    }

    /// Register a component under an existing parent. Parents must be
    /// registered first, which keeps the structure a tree by construction.
    pub fn register_component(
        &self,
        name: &str,
        parent: &str,
        isolation: IsolationLevel,
    ) -> Result<()> {
        if name.is_empty() || name == ROOT_COMPONENT {
            return Err(call_error!(InvalidParameter; "invalid component name {:?}", name).into());
        }
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(name) {
            return Err(
                call_error!(AlreadyRegistered; "component {} already registered", name).into(),
            );
        }
        if !nodes.contains_key(parent) {
            return Err(call_error!(InvalidParameter; "unknown parent component {}", parent).into());
        }
        let mut node = ComponentNode::new(Some(parent.to_owned()), isolation);
        if let Some(mode) = self.defaults.read().unwrap().get(name) {
            node.default_mode = *mode;
        }
        nodes.insert(name.to_owned(), node);
        nodes
            .get_mut(parent)
            .expect("parent checked above")
            .children
            .push(name.to_owned());
        Ok(())
    }

    pub fn set_state(&self, name: &str, state: ComponentState) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(name) {
            node.state = state;
        }
    }

    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.nodes.read().unwrap().get(name).map(|n| n.state)
    }

    pub fn isolation(&self, name: &str) -> Option<IsolationLevel> {
        self.nodes.read().unwrap().get(name).map(|n| n.isolation)
    }

    pub fn set_security(&self, name: &str, security: SecurityContext) {
        if let Some(node) = self.nodes.write().unwrap().get_mut(name) {
            node.security = security;
        }
    }

    pub fn security(&self, name: &str) -> Option<SecurityContext> {
        self.nodes.read().unwrap().get(name).map(|n| n.security.clone())
    }

    /// Set the propagation mode used by handlers registered without an
    /// explicit one (the `error.propagation.<component>` config surface).
    /// Remembered for components that register later.
    pub fn set_default_propagation(&self, name: &str, mode: PropagationMode) {
        self.defaults.write().unwrap().insert(name.to_owned(), mode);
        if let Some(node) = self.nodes.write().unwrap().get_mut(name) {
            node.default_mode = mode;
        }
    }

    /// Register a handler with the component's default propagation mode.
    pub fn on_error(
        &self,
        component: &str,
        handler: impl Fn(&ErrorEntry) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        let mode = self
            .nodes
            .read()
            .unwrap()
            .get(component)
            .map(|n| n.default_mode)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown component {}", component))?;
        self.on_error_with(component, mode, handler)
    }

    /// Register a handler with an explicit propagation mode.
    pub fn on_error_with(
        &self,
        component: &str,
        mode: PropagationMode,
        handler: impl Fn(&ErrorEntry) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(component)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown component {}", component))?;
        node.handlers.push((mode, Arc::new(handler)));
        Ok(())
    }

    /// Returns false once a component has failed fatally; the gateway
    /// refuses to route to unroutable components until restart.
    pub fn is_routable(&self, component: &str) -> bool {
        !matches!(self.state(component), Some(ComponentState::Error))
    }

    /// Has an unhandled Fatal reached the root?
    pub fn core_fatal(&self) -> bool {
        self.core_fatal.load(Ordering::Acquire)
    }

    /// Raise an error against its component and route it.
    pub fn raise(&self, entry: ErrorEntry) -> Disposition {
        self.externs.emit(TraceEvent::ErrorRaised {
            ident: Identifier::random(),
            component: entry.component.clone(),
            code: entry.code,
            severity: entry.severity,
        });

        if entry.severity == Severity::Info {
            // Info is not an error; traced only.
            log::trace!("{}: {}", entry.component, entry.message);
            return Disposition::Handled;
        }

        self.journal.lock().unwrap().push(entry.clone());

        if entry.severity == Severity::Fatal {
            self.set_state(&entry.component, ComponentState::Error);
        }

        let mut handled = false;
        let mut reached_root = entry.component == ROOT_COMPONENT;

        // Handlers at the raising component, in registration order. Each
        // registration's mode says where the entry travels next.
        let local = self.handlers_of(&entry.component);
        let mut up = false;
        let mut down = false;
        for (mode, handler) in local {
            handled |= invoke(&entry, &handler);
            match mode {
                PropagationMode::None => {}
                PropagationMode::Upward => up = true,
                PropagationMode::Downward => down = true,
                PropagationMode::Bidirectional => {
                    up = true;
                    down = true;
                }
            }
        }

        if up {
            let (h, r) = self.notify_ancestors(&entry);
            handled |= h;
            reached_root |= r;
        }
        if down {
            handled |= self.notify_descendants(&entry);
        }

        if !handled && reached_root && entry.severity == Severity::Fatal {
            self.core_fatal.store(true, Ordering::Release);
            log::error!(
                "fatal error reached the root unhandled: {}: {}",
                entry.component,
                entry.code
            );
            return Disposition::FatalUnhandled;
        }
        if handled {
            Disposition::Handled
        } else {
            Disposition::Unhandled
        }
    }

    /// Drain the journal. Called once at shutdown to aggregate everything
    /// recorded since startup (or the previous drain).
    pub fn drain_journal(&self) -> Vec<ErrorEntry> {
        std::mem::take(&mut self.journal.lock().unwrap())
    }

    fn handlers_of(&self, component: &str) -> Vec<(PropagationMode, Handler)> {
        self.nodes
            .read()
            .unwrap()
            .get(component)
            .map(|n| n.handlers.clone())
            .unwrap_or_default()
    }

    /// Walk ancestors toward the root, invoking every handler on the way.
    /// Returns (handled, reached_root).
    fn notify_ancestors(&self, entry: &ErrorEntry) -> (bool, bool) {
        let mut handled = false;
        let mut current = self.parent_of(&entry.component);
        loop {
            let Some(name) = current else {
                return (handled, false);
            };
            for (_, handler) in self.handlers_of(&name) {
                handled |= invoke(entry, &handler);
            }
            if name == ROOT_COMPONENT {
                return (handled, true);
            }
            current = self.parent_of(&name);
        }
    }

    fn notify_descendants(&self, entry: &ErrorEntry) -> bool {
        let mut handled = false;
        let mut queue = self.children_of(&entry.component);
        while let Some(name) = queue.pop() {
            for (_, handler) in self.handlers_of(&name) {
                handled |= invoke(entry, &handler);
            }
            queue.extend(self.children_of(&name));
        }
        handled
    }

    fn parent_of(&self, component: &str) -> Option<String> {
        self.nodes.read().unwrap().get(component)?.parent.clone()
    }

    fn children_of(&self, component: &str) -> Vec<String> {
        self.nodes
            .read()
            .unwrap()
            .get(component)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }
}

fn invoke(entry: &ErrorEntry, handler: &Handler) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(entry))) {
        Ok(handled) => handled,
        Err(_) => {
            log::warn!(
                "{}: error handler raised while handling {}; ignored",
                entry.component,
                entry.code
            );
            false
        }
    }
}
