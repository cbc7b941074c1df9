use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use log::{error, info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::FeatureExtractor;

/// Where the process-wide embedding model is in its one-time lifecycle:
/// `Unloaded -> Loading -> Ready | LoadFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase
{
    Unloaded,
    Loading,
    Ready,
    LoadFailed,
}

impl fmt::Display for ModelPhase
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            ModelPhase::Unloaded => "unloaded",
            ModelPhase::Loading => "loading",
            ModelPhase::Ready => "ready",
            ModelPhase::LoadFailed => "load_failed",
        };
        f.write_str(name)
    }
}

enum InnerModelState
{
    Unloaded,
    Loading,
    Ready(Arc<dyn FeatureExtractor>),
    LoadFailed(String),
}

/// Holds the embedding model shared by all requests.
///
/// `load()` is the only way in; it runs at most once per process and is never retried.
/// Requests call `extractor()`, which refuses to hand out anything before `Ready`.
/// The lock is only held to read or flip the phase, never while the model loads or runs.
pub struct ModelState(RwLock<InnerModelState>);

impl Default for ModelState
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ModelState
{
    pub fn new() -> Self
    {
        ModelState(RwLock::new(InnerModelState::Unloaded))
    }

    /// A state that is already `Ready` with the given extractor.
    pub fn ready(extractor: Arc<dyn FeatureExtractor>) -> Self
    {
        ModelState(RwLock::new(InnerModelState::Ready(extractor)))
    }

    pub fn phase(&self) -> ModelPhase
    {
        match self.0.read() {
            Ok(inner) => match &*inner {
                InnerModelState::Unloaded => ModelPhase::Unloaded,
                InnerModelState::Loading => ModelPhase::Loading,
                InnerModelState::Ready(_) => ModelPhase::Ready,
                InnerModelState::LoadFailed(_) => ModelPhase::LoadFailed,
            },
            // A writer panicked mid-transition; nothing usable is behind the lock.
            Err(_) => ModelPhase::LoadFailed,
        }
    }

    /// The reason the load failed, if it did.
    pub fn load_error(&self) -> Option<String>
    {
        match &*self.0.read().ok()? {
            InnerModelState::LoadFailed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Loads the model with `loader`, moving `Unloaded -> Loading -> Ready | LoadFailed`.
    ///
    /// Only the first call does anything. Later calls (including after a failure)
    /// return the current phase without invoking `loader`.
    pub fn load<F>(&self, loader: F) -> ModelPhase
    where
        F: FnOnce() -> Result<Arc<dyn FeatureExtractor>>,
    {
        {
            let Ok(mut inner) = self.0.write() else {
                return ModelPhase::LoadFailed;
            };
            if !matches!(*inner, InnerModelState::Unloaded) {
                drop(inner);
                let phase = self.phase();
                warn!("Embedding model load requested again while {}; ignoring", phase);
                return phase;
            }
            *inner = InnerModelState::Loading;
        }

        // A panicking loader must still leave the model in a terminal phase.
        let next = match panic::catch_unwind(AssertUnwindSafe(loader)) {
            Ok(Ok(extractor)) => {
                info!("Embedding model ready (embedding dimension {})", extractor.embedding_dim());
                InnerModelState::Ready(extractor)
            }
            Ok(Err(e)) => {
                error!("Embedding model failed to load: {}", e);
                InnerModelState::LoadFailed(e.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Embedding model loader panicked: {}", reason);
                InnerModelState::LoadFailed(format!("model loader panicked: {reason}"))
            }
        };

        match self.0.write() {
            Ok(mut inner) => *inner = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        self.phase()
    }

    /// The loaded extractor, or `ModelNotReady` carrying the current phase.
    pub fn extractor(&self) -> Result<Arc<dyn FeatureExtractor>>
    {
        let inner = self.0.read()
            .map_err(|_| Error::ModelNotReady(ModelPhase::LoadFailed))?;
        match &*inner {
            InnerModelState::Ready(extractor) => Ok(Arc::clone(extractor)),
            InnerModelState::Unloaded => Err(Error::ModelNotReady(ModelPhase::Unloaded)),
            InnerModelState::Loading => Err(Error::ModelNotReady(ModelPhase::Loading)),
            InnerModelState::LoadFailed(_) => Err(Error::ModelNotReady(ModelPhase::LoadFailed)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String
{
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
