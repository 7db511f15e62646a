//! Run-once state shared by validators and factories.

use crate::error::EnvelopeError;

#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Pending,
    Done(T),
    Failed(EnvelopeError),
}

impl<T> Outcome<T> {
    /// Drive `stages` the first time only; later calls return the cached
    /// result.
    pub(crate) fn settle<F>(&mut self, pipeline: &'static str, stages: F) -> bool
    where
        F: FnOnce() -> Result<T, EnvelopeError>,
    {
        if matches!(self, Outcome::Pending) {
            *self = match stages() {
                Ok(value) => {
                    tracing::debug!(pipeline, "accepted");
                    Outcome::Done(value)
                }
                Err(e) => {
                    tracing::warn!(pipeline, kind = e.kind(), reason = %e, "rejected");
                    Outcome::Failed(e)
                }
            };
        }
        matches!(self, Outcome::Done(_))
    }

    pub(crate) fn error(&self) -> Option<&EnvelopeError> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn value(&self) -> Option<&T> {
        match self {
            Outcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn into_value(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            _ => None,
        }
    }
}
