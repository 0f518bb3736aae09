//! Crate-root error aggregation.

use thiserror::Error;

use crate::bandwidth::BandwidthError;
use crate::chunk::ChunkError;
use crate::classifier::ClassifierError;
use crate::connection::ConnectionError;
use crate::queue::QueueError;
use crate::resume::ResumeError;
use crate::session::SessionError;

/// Umbrella error for call sites that span more than one subsystem and do
/// not need to match on which one failed.
#[derive(Error, Debug)]
pub enum TransferCoreError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Bandwidth(#[from] BandwidthError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TransferCoreError>;
