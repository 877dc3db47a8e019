use crate::ids::OpId;

/// Opaque GPU completion marker.
///
/// Backends map the token to their native sync object. The token stays meaningful until
/// the next iteration records a newer fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceToken(pub u64);

/// Notifications emitted by the engine to presentation, recording and UI collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// One iteration was submitted; `fence` signals when its GPU work completes.
    FrameReady { fence: FenceToken, iteration: u64 },
    /// Every texture was reallocated; cached texture ids must be re-resolved.
    TexturesChanged,
    /// The recording sink accepted its `n`-th frame (emitted every 60 frames).
    FrameRecorded(u64),
    /// An operation stopped (or resumed) participating in rendering.
    OperationSkipped { op: OpId, skipped: bool },
    /// A screenshot was written (or failed to be written).
    ScreenshotSaved { path: std::path::PathBuf, ok: bool },
    /// Unrecoverable condition; the render loop has stopped.
    Fatal(String),
}
