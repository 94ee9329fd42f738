use super::ProbeSpec;
use crate::channel::RecordSource;
use crate::domain::{AttachmentError, ChannelError};

/// The operations the lifecycle drives, one call per probe per stage.
///
/// Teardown calls (`detach`, `unload`, `close`) cannot fail from the caller's
/// point of view; implementations log and carry on.
pub trait ProbeBackend {
    /// Parse the object, create its maps and verify every declared program exists.
    ///
    /// # Errors
    /// [`AttachmentError::OpenFailed`]
    fn open(&mut self, probes: &[ProbeSpec]) -> Result<(), AttachmentError>;

    /// # Errors
    /// [`AttachmentError::LoadFailed`]
    fn load(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError>;

    /// # Errors
    /// [`AttachmentError::AttachFailed`]
    fn attach(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError>;

    fn detach(&mut self, probe: &ProbeSpec);

    fn unload(&mut self, probe: &ProbeSpec);

    fn close(&mut self);

    /// Take the event channel out of the opened object.
    ///
    /// # Errors
    /// [`ChannelError`] if the channel map is missing or of the wrong type.
    fn event_channel(&mut self) -> Result<Box<dyn RecordSource>, ChannelError>;
}
