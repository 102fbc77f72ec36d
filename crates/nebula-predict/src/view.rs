//! Handles a presentation layer uses to reach an instance's state without
//! knowing how it is stored.
//!
//! A [`FrameHandle`] names an instance and a slot. It is resolved on every
//! access through [`crate::PredictionWorld::with_frame`], so a handle kept
//! across frames simply stops resolving once its frame leaves the buffer.

use crate::instance::InstanceId;
use crate::model::{SimTypeId, Simulation};
use crate::store::{InstanceData, Record};

/// Which record of an instance a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewSlot {
    /// A frame in the instance's buffer.
    Frame(i32),
    /// The smoothed or interpolated state last presented.
    Presentation,
    /// The presentation before the last one.
    PreviousPresentation,
}

/// `{instance, frame}` handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub instance: InstanceId,
    pub frame: ViewSlot,
}

/// Handles to the records a consumer usually reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceView {
    pub instance: InstanceId,
    pub sim: SimTypeId,
    /// Frame the next tick will read from.
    pub pending: FrameHandle,
    pub presentation: FrameHandle,
    pub previous_presentation: FrameHandle,
}

impl InstanceView {
    pub fn new(instance: InstanceId, sim: SimTypeId, pending_frame: i32) -> Self {
        let handle = |frame| FrameHandle { instance, frame };
        Self {
            instance,
            sim,
            pending: handle(ViewSlot::Frame(pending_frame)),
            presentation: handle(ViewSlot::Presentation),
            previous_presentation: handle(ViewSlot::PreviousPresentation),
        }
    }
}

impl<S: Simulation> InstanceData<S> {
    /// Record a slot refers to, or `None` once it is gone.
    pub fn resolve(&self, slot: ViewSlot) -> Option<&Record<S>> {
        match slot {
            ViewSlot::Frame(frame) => self.frames.contains(frame).then(|| self.frames.get(frame)),
            ViewSlot::Presentation => self.presentation.as_ref(),
            ViewSlot::PreviousPresentation => self.previous_presentation.as_ref(),
        }
    }

    pub fn resolve_mut(&mut self, slot: ViewSlot) -> Option<&mut Record<S>> {
        match slot {
            ViewSlot::Frame(frame) => {
                if self.frames.contains(frame) {
                    Some(self.frames.get_mut(frame))
                } else {
                    None
                }
            }
            ViewSlot::Presentation => self.presentation.as_mut(),
            ViewSlot::PreviousPresentation => self.previous_presentation.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{BitReader, BitWriter};
    use crate::error::WireError;
    use crate::frame_buffer::FrameRecord;
    use crate::instance::InstanceConfig;
    use crate::model::{NetState, TickOutput};
    use crate::tick::NetSimTimeStep;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Level(u8);

    impl NetState for Level {
        fn write_full(&self, writer: &mut BitWriter) {
            writer.write_u8(self.0);
        }

        fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
            Ok(Level(reader.read_u8()?))
        }
    }

    struct Lamp;

    impl Simulation for Lamp {
        type Input = ();
        type Sync = Level;
        type Aux = ();
        const NAME: &'static str = "lamp";

        fn simulation_tick(&mut self, _: &NetSimTimeStep, _: &(), sync: &Level, _: &()) -> TickOutput<Level, ()> {
            TickOutput::new(Level(sync.0 + 1), ())
        }
    }

    #[test]
    fn test_stale_frames_do_not_resolve() {
        let mut data = InstanceData::new(Lamp, InstanceConfig::authority(), None, 4, 0);
        assert!(data.resolve(ViewSlot::Frame(0)).is_some());
        data.frames.get_mut(5).sync = Level(9);

        assert!(data.resolve(ViewSlot::Frame(0)).is_none());
        assert!(data.resolve(ViewSlot::Frame(6)).is_none());
        assert_eq!(data.resolve(ViewSlot::Frame(5)).map(|r| r.sync.0), Some(9));
        assert!(data.resolve_mut(ViewSlot::Frame(1)).is_none());
    }

    #[test]
    fn test_presentation_slots() {
        let mut data = InstanceData::new(Lamp, InstanceConfig::authority(), None, 4, 0);
        assert!(data.resolve(ViewSlot::Presentation).is_none());

        let shown = |level| FrameRecord {
            sync: Level(level),
            ..Record::<Lamp>::default()
        };
        data.set_presentation(shown(1));
        data.set_presentation(shown(2));
        assert_eq!(data.resolve(ViewSlot::Presentation).map(|r| r.sync.0), Some(2));
        assert_eq!(data.resolve(ViewSlot::PreviousPresentation).map(|r| r.sync.0), Some(1));

        if let Some(record) = data.resolve_mut(ViewSlot::Presentation) {
            record.sync = Level(7);
        }
        assert_eq!(data.presentation.map(|r| r.sync), Some(Level(7)));

        let view = InstanceView::new(InstanceId(3), SimTypeId(0), 5);
        assert_eq!(view.pending.frame, ViewSlot::Frame(5));
        assert_eq!(view.presentation.instance, InstanceId(3));
    }
}
