//! Fixed-capacity ring buffer indexed by frame number.
//!
//! Writes never fail: frame `f` lives in slot `f mod capacity`, so a write at
//! `f + capacity` silently replaces `f`. Reads outside the live window
//! `[latest - capacity + 1, latest]` return whatever the slot holds now;
//! callers that care use [`FrameBuffer::contains`].

use crate::INDEX_NONE;

/// Ring buffer of `T` keyed by frame number.
#[derive(Debug, Clone)]
pub struct FrameBuffer<T> {
    slots: Vec<T>,
    latest_written: i32,
}

impl<T: Default + Clone> FrameBuffer<T> {
    /// Create a buffer with `capacity` default-initialised slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![T::default(); capacity.max(1)],
            latest_written: INDEX_NONE,
        }
    }
}

impl<T> FrameBuffer<T> {
    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest frame written so far, or [`INDEX_NONE`].
    pub fn latest_written(&self) -> i32 {
        self.latest_written
    }

    fn slot(&self, frame: i32) -> usize {
        frame.rem_euclid(self.slots.len() as i32) as usize
    }

    /// Overwrite the slot for `frame`.
    pub fn set(&mut self, frame: i32, value: T) {
        let idx = self.slot(frame);
        self.slots[idx] = value;
        self.latest_written = self.latest_written.max(frame);
    }

    /// The slot for `frame`. Stale if `frame` is outside the live window.
    pub fn get(&self, frame: i32) -> &T {
        &self.slots[self.slot(frame)]
    }

    /// Mutable slot for `frame`; counts as a write of `frame`.
    pub fn get_mut(&mut self, frame: i32) -> &mut T {
        self.latest_written = self.latest_written.max(frame);
        let idx = self.slot(frame);
        &mut self.slots[idx]
    }

    /// Whether `frame` is still inside `[latest - capacity + 1, latest]`.
    pub fn contains(&self, frame: i32) -> bool {
        self.latest_written != INDEX_NONE
            && frame <= self.latest_written
            && frame > self.latest_written - self.slots.len() as i32
    }
}

impl<T: Clone> FrameBuffer<T> {
    /// Copy the contents of `src` into `dst`.
    pub fn copy_frame(&mut self, src: i32, dst: i32) {
        let value = self.get(src).clone();
        self.set(dst, value);
    }
}

// ---------------------------------------------------------------------------
// Frame record
// ---------------------------------------------------------------------------

/// One state triple plus the interpolation timestamp seen when it was produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRecord<I, S, A> {
    /// Input command consumed by the tick that starts at this frame.
    pub input: I,
    /// Authoritative/reconciled state at this frame.
    pub sync: S,
    /// Rarely-changing auxiliary state at this frame.
    pub aux: A,
    /// Client interpolation time when the input was produced, in ms.
    pub interpolation_time_ms: f32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_set_until_wrap() {
        let mut buf: FrameBuffer<i32> = FrameBuffer::new(8);
        for frame in 0..8 {
            buf.set(frame, frame * 10);
        }
        for frame in 0..8 {
            assert_eq!(*buf.get(frame), frame * 10);
        }

        // Writing frame 8 replaces frame 0 and only frame 0.
        buf.set(8, 800);
        assert_eq!(*buf.get(0), 800);
        assert_eq!(*buf.get(1), 10);
        assert_eq!(*buf.get(8), 800);
    }

    #[test]
    fn test_live_window_tracks_latest() {
        let mut buf: FrameBuffer<u8> = FrameBuffer::new(4);
        assert!(!buf.contains(0));
        assert_eq!(buf.latest_written(), INDEX_NONE);

        for frame in 0..10 {
            buf.set(frame, 1);
        }
        assert_eq!(buf.latest_written(), 9);
        assert!(buf.contains(9));
        assert!(buf.contains(6));
        assert!(!buf.contains(5));
        assert!(!buf.contains(10));
    }

    #[test]
    fn test_older_write_does_not_move_latest() {
        let mut buf: FrameBuffer<u8> = FrameBuffer::new(16);
        buf.set(12, 1);
        buf.set(3, 2);
        assert_eq!(buf.latest_written(), 12);
        assert_eq!(*buf.get(3), 2);
    }

    #[test]
    fn test_negative_frames_map_to_valid_slots() {
        let mut buf: FrameBuffer<i32> = FrameBuffer::new(4);
        buf.set(-1, 7);
        assert_eq!(*buf.get(3), 7);
    }

    #[test]
    fn test_copy_frame_and_get_mut() {
        let mut buf: FrameBuffer<FrameRecord<i32, i32, ()>> = FrameBuffer::new(4);
        buf.get_mut(1).sync = 5;
        buf.copy_frame(1, 2);
        assert_eq!(buf.get(2).sync, 5);
        assert_eq!(buf.latest_written(), 2);
    }
}
