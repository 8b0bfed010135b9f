//! Runtime payload validation as an injected capability.
//!
//! The engine never assumes a concrete validation library: it holds
//! [`PayloadSchema`] trait objects and asks them to accept or refuse a raw
//! JSON value. [`SerdeSchema`] is the serde-backed implementation used by
//! the typed [`MethodDef`]/[`EventDef`] layer.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A raw payload failed shape validation.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

/// Decode-or-fail capability checked against every payload that crosses a
/// validation boundary: inbound requests, inbound responses, inbound event
/// data.
pub trait PayloadSchema: Send + Sync {
    /// Accept the value or explain why it does not fit.
    fn check(&self, raw: &Value) -> Result<(), SchemaError>;
}

/// [`PayloadSchema`] backed by serde deserialization into `T`. A value is
/// well-shaped exactly when `T` deserializes from it.
pub struct SerdeSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSchema<T> {
    /// Create the schema for `T`.
    pub const fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for SerdeSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> PayloadSchema for SerdeSchema<T> {
    fn check(&self, raw: &Value) -> Result<(), SchemaError> {
        match T::deserialize(raw) {
            Ok(_) => Ok(()),
            Err(err) => Err(SchemaError(err.to_string())),
        }
    }
}

/// Named method signature: request type in, response type out. Instances
/// are cheap markers; the same definition is used on the registering side
/// and the calling side so both ends validate against the same shapes.
pub struct MethodDef<Req, Resp> {
    name: &'static str,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> MethodDef<Req, Resp> {
    /// Define a method under a wire name.
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    /// The wire name calls are issued and dispatched under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schema accepting well-shaped request payloads.
    pub fn request_schema(&self) -> Arc<dyn PayloadSchema>
    where
        Req: DeserializeOwned + 'static,
    {
        Arc::new(SerdeSchema::<Req>::new())
    }

    /// Schema accepting well-shaped response payloads.
    pub fn response_schema(&self) -> Arc<dyn PayloadSchema>
    where
        Resp: DeserializeOwned + 'static,
    {
        Arc::new(SerdeSchema::<Resp>::new())
    }
}

/// Named event signature carrying a data type. Events are one-way; there
/// is no response shape.
pub struct EventDef<D> {
    name: &'static str,
    _marker: PhantomData<fn(D)>,
}

impl<D> EventDef<D> {
    /// Define an event under a wire name.
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    /// The wire name the event is emitted and dispatched under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schema accepting well-shaped event data.
    pub fn data_schema(&self) -> Arc<dyn PayloadSchema>
    where
        D: DeserializeOwned + 'static,
    {
        Arc::new(SerdeSchema::<D>::new())
    }
}
