use crossbeam_channel::Sender;

use crate::loader::LoaderEvent;
use crate::resource::{Resource, ResourceData, ResourceType};
use freight_base::ResourceHandle;

/// Which of the two stage series a stage belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    /// Runs before the transport operation; a stage here may mark the
    /// resource complete, which short-circuits the rest of the phase and
    /// skips transport entirely
    Before,
    /// Runs after transport completion, success or error, so stages can
    /// react to or clean up after failures
    After,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Before => "pre-load",
            Phase::After => "post-load",
        }
    }
}

/// Type that allows a middleware stage to signal that it has finished and the
/// series should advance. Advancing consumes the token, so a stage cannot
/// signal twice; dropping it without advancing aborts the resource with a
/// stalled-pipeline error rather than wedging the series.
pub struct StageToken {
    sender: Option<Sender<LoaderEvent>>,
    handle: ResourceHandle,
    phase: Phase,
    next_index: usize,
}

impl StageToken {
    pub(crate) fn new(
        sender: Sender<LoaderEvent>,
        handle: ResourceHandle,
        phase: Phase,
        next_index: usize,
    ) -> Self {
        Self {
            sender: Some(sender),
            handle,
            phase,
            next_index,
        }
    }

    /// Advances the series to the next stage. May be called synchronously
    /// from the stage body or later, after the stage's own asynchronous work.
    pub fn advance(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(LoaderEvent::StageComplete {
                handle: self.handle,
                phase: self.phase,
                next_index: self.next_index,
            });
        }
    }
}

impl Drop for StageToken {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(LoaderEvent::StageDropped {
                handle: self.handle,
                phase: self.phase,
            });
        }
    }
}

/// One transform step in the pre- or post-load series. Stages run in
/// registration order, defaults first, and each must advance its token
/// exactly once for the series to make progress.
pub trait LoadStage {
    fn run(
        &mut self,
        resource: &mut Resource,
        next: StageToken,
    );
}

impl<F> LoadStage for F
where
    F: FnMut(&mut Resource, StageToken),
{
    fn run(
        &mut self,
        resource: &mut Resource,
        next: StageToken,
    ) {
        self(resource, next)
    }
}

/// Built-in post-load stages, installed ahead of caller-registered ones.
pub(crate) fn default_after_stages() -> Vec<Box<dyn LoadStage>> {
    vec![Box::new(coerce_kind), Box::new(release_scratch_on_error)]
}

// Refine an Unknown content kind from the decoded payload shape
fn coerce_kind(
    resource: &mut Resource,
    next: StageToken,
) {
    if resource.kind() == ResourceType::Unknown {
        let kind = match resource.data() {
            ResourceData::Json(_) => Some(ResourceType::Json),
            ResourceData::Xml(_) => Some(ResourceType::Xml),
            ResourceData::Text(_) => Some(ResourceType::Text),
            ResourceData::Bytes(_) => Some(ResourceType::Binary),
            ResourceData::None => None,
        };
        if let Some(kind) = kind {
            resource.set_kind(kind);
        }
    }
    next.advance();
}

// A failed resource has no further use for the undecoded payload; drop it
// here so errored loads do not pin their transport buffers until cycle end
fn release_scratch_on_error(
    resource: &mut Resource,
    next: StageToken,
) {
    if resource.error().is_some() {
        resource.release_scratch();
    }
    next.advance();
}
