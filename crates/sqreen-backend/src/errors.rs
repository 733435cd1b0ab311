// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error context propagation.
//!
//! A [`ContextError`] is a chain of nodes built by wrapping: each node either
//! prefixes a message onto the rendering of its cause ([`wrap`]) or carries a
//! diagnostic [`Attachment`] ([`with_info`]). The innermost node holds the
//! root cause, which can be any error type.
//!
//! [`ErrorCollection`] is different: it aggregates independent failures that
//! must be reported together, for example the batch upload and the logout
//! call of a shutdown sequence.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Diagnostic payload attached to an error node.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// String-to-string mapping, the only kind returned by [`info`].
    Info(HashMap<String, String>),
    /// Any other value. Kept so callers can attach scalar diagnostics.
    Other(Value),
}

impl From<HashMap<String, String>> for Attachment {
    fn from(info: HashMap<String, String>) -> Self {
        Attachment::Info(info)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Attachment {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Attachment::Info(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }
}

impl From<Value> for Attachment {
    fn from(value: Value) -> Self {
        Attachment::Other(value)
    }
}

impl From<&str> for Attachment {
    fn from(value: &str) -> Self {
        Attachment::Other(Value::from(value))
    }
}

impl From<String> for Attachment {
    fn from(value: String) -> Self {
        Attachment::Other(Value::from(value))
    }
}

impl From<i64> for Attachment {
    fn from(value: i64) -> Self {
        Attachment::Other(Value::from(value))
    }
}

enum Cause {
    Link(Box<ContextError>),
    Root(BoxError),
}

/// One node of an error chain.
pub struct ContextError {
    message: Option<String>,
    attachment: Option<Attachment>,
    cause: Cause,
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl ContextError {
    /// Starts a chain from an arbitrary root cause.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: None,
            attachment: None,
            cause: Cause::Root(Box::new(error)),
        }
    }

    /// Starts a chain from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    fn link(self, message: Option<String>, attachment: Option<Attachment>) -> Self {
        Self {
            message,
            attachment,
            cause: Cause::Link(Box::new(self)),
        }
    }

    /// Iterates over the nodes from the outermost to the innermost.
    fn nodes(&self) -> impl Iterator<Item = &ContextError> {
        std::iter::successors(Some(self), |node| match &node.cause {
            Cause::Link(inner) => Some(&**inner),
            Cause::Root(_) => None,
        })
    }

    /// Returns the error the chain was started from.
    pub fn root_cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        let mut node = self;
        loop {
            match &node.cause {
                Cause::Link(inner) => node = &**inner,
                Cause::Root(root) => return &**root,
            }
        }
    }

    /// Returns the root cause if it is of type `T`.
    pub fn downcast_root<T>(&self) -> Option<&T>
    where
        T: std::error::Error + 'static,
    {
        self.root_cause().downcast_ref::<T>()
    }

    /// Mapping attachment closest to the root cause, the one [`info`] returns.
    fn deepest_info_mut(&mut self) -> Option<&mut HashMap<String, String>> {
        let own = match &mut self.attachment {
            Some(Attachment::Info(info)) => Some(info),
            _ => None,
        };
        let deeper = match &mut self.cause {
            Cause::Link(inner) => inner.deepest_info_mut(),
            Cause::Root(_) => None,
        };
        deeper.or(own)
    }

    /// Attachments of the chain, outermost first.
    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.nodes().filter_map(|node| node.attachment.as_ref())
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{message}: ")?;
        }
        match &self.cause {
            Cause::Link(inner) => fmt::Display::fmt(inner, f),
            Cause::Root(root) => fmt::Display::fmt(root, f),
        }
    }
}

impl fmt::Debug for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ContextError");
        debug.field("error", &self.to_string());
        let attachments: Vec<&Attachment> = self.attachments().collect();
        if !attachments.is_empty() {
            debug.field("attachments", &attachments);
        }
        debug.field("root_cause", &self.root_cause()).finish()
    }
}

impl std::error::Error for ContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Cause::Link(inner) => Some(&**inner as &(dyn std::error::Error + 'static)),
            Cause::Root(root) => Some(&**root as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Returns a new error wrapping `err` and carrying `attachment`.
pub fn with_info(err: impl Into<ContextError>, attachment: impl Into<Attachment>) -> ContextError {
    err.into().link(None, Some(attachment.into()))
}

/// Returns a new error whose rendering is `"<message>: <err>"`.
pub fn wrap(err: impl Into<ContextError>, message: impl Into<String>) -> ContextError {
    err.into().link(Some(message.into()), None)
}

/// Returns the mapping attachment closest to the root cause, if any.
///
/// Attachments of other kinds are skipped: they neither match nor hide a
/// deeper mapping.
pub fn info(err: &ContextError) -> Option<&HashMap<String, String>> {
    err.attachments()
        .filter_map(|attachment| match attachment {
            Attachment::Info(info) => Some(info),
            Attachment::Other(_) => None,
        })
        .last()
}

/// Adds `entries` to the mapping returned by [`info`], replacing existing keys.
///
/// Attaches a new mapping when the chain carries none.
pub fn extend_info<I, K, V>(mut err: ContextError, entries: I) -> ContextError
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let entries = entries.into_iter().map(|(k, v)| (k.into(), v.into()));
    if let Some(info) = err.deepest_info_mut() {
        info.extend(entries);
        return err;
    }
    with_info(err, entries.collect::<HashMap<String, String>>())
}

/// Ordered set of independent errors reported as one.
#[derive(Debug, Default)]
pub struct ErrorCollection {
    errors: Vec<ContextError>,
}

impl ErrorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `err`. Passing `None` is a no-op.
    pub fn add(&mut self, err: impl Into<Option<ContextError>>) {
        if let Some(err) = err.into() {
            self.errors.push(err);
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextError> {
        self.errors.iter()
    }

    /// `Ok` when nothing was collected, so an empty collection is never rendered.
    pub fn into_result(self) -> Result<(), ErrorCollection> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("multiple errors occurred: ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "({err}) {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorCollection {}
