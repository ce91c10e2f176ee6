//! Lifecycle callbacks
//!
//! Cross-cutting behaviour (frame annotation, timeouts, notifications) hooks
//! into fixed points of a recording lifecycle. Each [`Callback`] declares the
//! [`ExecPoint`] it runs at and a priority; the [`CallbackRegistry`] keeps the
//! handlers of every point sorted by descending priority and invokes them
//! synchronously with a point-specific [`Context`].
//!
//! Handlers are shared (`Arc<Mutex<_>>`) so that a filtered subset can be
//! handed to the encoder thread via [`CallbackRegistry::subset`].

mod handlers;

pub use handlers::{AnnotateFrameWithDt, EchoCallback, ExecutionTimeout};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::camera::FrameSource;
use crate::error::{Error, Result};

/// Default handler priority.
pub const DEFAULT_PRIORITY: i32 = -1;

/// Named moment in the capture lifecycle.
///
/// Ordered by declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecPoint {
    BeforeInit,
    AfterInit,
    BeforeRecord,
    BeforeStackCapture,
    BeforeFrameCapture,
    AfterFrameCapture,
    AfterStackCapture,
    AfterRecord,
    BeforeConvert,
    AfterConvert,
    OnException,
}

impl fmt::Display for ExecPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecPoint::BeforeInit => "BEFORE_INIT",
            ExecPoint::AfterInit => "AFTER_INIT",
            ExecPoint::BeforeRecord => "BEFORE_RECORD",
            ExecPoint::BeforeStackCapture => "BEFORE_STACK_CAPTURE",
            ExecPoint::BeforeFrameCapture => "BEFORE_FRAME_CAPTURE",
            ExecPoint::AfterFrameCapture => "AFTER_FRAME_CAPTURE",
            ExecPoint::AfterStackCapture => "AFTER_STACK_CAPTURE",
            ExecPoint::AfterRecord => "AFTER_RECORD",
            ExecPoint::BeforeConvert => "BEFORE_CONVERT",
            ExecPoint::AfterConvert => "AFTER_CONVERT",
            ExecPoint::OnException => "ON_EXCEPTION",
        };
        f.write_str(s)
    }
}

/// Data handed to a callback, depending on where it runs.
pub enum Context<'a> {
    /// No extra data (init, record and stack boundaries)
    None,
    /// The live camera, around each frame capture
    Camera(&'a mut dyn FrameSource),
    /// The frame stack about to be converted
    StackDir(&'a Path),
    /// The destination video file (after record, after convert)
    Output(&'a Path),
    /// The error about to be raised
    Error(&'a Error),
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::None => f.write_str("None"),
            Context::Camera(cam) => write!(f, "Camera({})", cam.name()),
            Context::StackDir(p) => write!(f, "StackDir({})", p.display()),
            Context::Output(p) => write!(f, "Output({})", p.display()),
            Context::Error(e) => write!(f, "Error({})", e),
        }
    }
}

/// A handler hooked into one [`ExecPoint`].
pub trait Callback: Send {
    /// The execution point this handler belongs to.
    fn exec_at(&self) -> ExecPoint;

    /// Higher runs first. Ties run in registration order.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the handler. An error aborts the remaining handlers of this point.
    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()>;
}

/// A handler shared between registries.
pub type SharedCallback = Arc<Mutex<dyn Callback>>;

#[derive(Clone)]
struct Entry {
    priority: i32,
    name: String,
    handler: SharedCallback,
}

/// Registry of callbacks keyed by execution point.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    points: BTreeMap<ExecPoint, Vec<Entry>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (point, entries) in &self.points {
            let names: Vec<(&str, i32)> =
                entries.iter().map(|e| (e.name.as_str(), e.priority)).collect();
            map.entry(point, &names);
        }
        map.finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of handlers, in registration order.
    pub fn with_callbacks(callbacks: Vec<Box<dyn Callback>>) -> Self {
        let mut registry = Self::new();
        for cb in callbacks {
            registry.register_boxed(cb);
        }
        registry
    }

    /// Register a handler under its declared execution point.
    pub fn register<C: Callback + 'static>(&mut self, callback: C) -> &mut Self {
        self.register_shared(Arc::new(Mutex::new(callback)))
    }

    pub fn register_boxed(&mut self, callback: Box<dyn Callback>) -> &mut Self {
        self.register_shared(Arc::new(Mutex::new(callback)))
    }

    /// Register an already shared handler, re-sorting its point.
    pub fn register_shared(&mut self, handler: SharedCallback) -> &mut Self {
        let (point, priority, name) = {
            let guard = match handler.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            (guard.exec_at(), guard.priority(), guard.name().to_string())
        };
        let entries = self.points.entry(point).or_default();
        entries.push(Entry {
            priority,
            name,
            handler,
        });
        // stable: equal priorities keep registration order
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        self
    }

    /// Handlers registered for `point`, in invocation order.
    pub fn handlers(&self, point: ExecPoint) -> Vec<SharedCallback> {
        self.points
            .get(&point)
            .map(|entries| entries.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of the handlers registered for `point`, in invocation order.
    pub fn handler_names(&self, point: ExecPoint) -> Vec<String> {
        self.points
            .get(&point)
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }

    /// A new registry sharing only the handlers of the given points.
    pub fn subset(&self, points: &[ExecPoint]) -> Self {
        let points = self
            .points
            .iter()
            .filter(|(p, _)| points.contains(p))
            .map(|(p, entries)| (*p, entries.clone()))
            .collect();
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.values().all(|v| v.is_empty())
    }

    /// Invoke every handler of `point` in order.
    ///
    /// The first failing handler aborts the dispatch and its error is returned.
    pub fn dispatch(&self, point: ExecPoint, ctx: &mut Context<'_>) -> Result<()> {
        let Some(entries) = self.points.get(&point) else {
            return Ok(());
        };
        for entry in entries {
            log::trace!("[callback] {} at {} ({:?})", entry.name, point, ctx);
            let mut handler = entry.handler.lock().map_err(|_| {
                Error::Callback(format!("handler '{}' is poisoned", entry.name))
            })?;
            handler.call(ctx)?;
        }
        Ok(())
    }

    /// Dispatch without extra context.
    pub fn dispatch_plain(&self, point: ExecPoint) -> Result<()> {
        self.dispatch(point, &mut Context::None)
    }

    /// Run the `OnException` handlers for `err`, then hand it back for raising.
    ///
    /// A failing exception handler is logged; the original error is always
    /// returned.
    pub fn dispatch_and_raise(&self, err: Error) -> Error {
        if let Err(handler_err) = self.dispatch(ExecPoint::OnException, &mut Context::Error(&err)) {
            log::error!(
                "[callback] exception handler failed while reporting '{}': {}",
                err,
                handler_err
            );
        }
        err
    }
}

impl<C: Callback + ?Sized> Callback for Box<C> {
    fn exec_at(&self) -> ExecPoint {
        (**self).exec_at()
    }

    fn priority(&self) -> i32 {
        (**self).priority()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        (**self).call(ctx)
    }
}
