//! The contract a simulation implements to plug into the engine.
//!
//! A simulation supplies three state types (input, sync, aux), each
//! implementing [`NetState`], plus a [`Simulation`] driver that produces input
//! and advances one step. Simulation types are registered at runtime in a
//! [`ModelRegistry`] keyed by their `TypeId`; the rest of the engine only ever
//! sees the small [`SimTypeId`] handed out there.

use std::any::TypeId;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::bits::{BitReader, BitWriter};
use crate::cues::NetCue;
use crate::error::WireError;
use crate::tick::NetSimTimeStep;

// ---------------------------------------------------------------------------
// State hooks
// ---------------------------------------------------------------------------

/// A replicated state type.
///
/// Only `write_full` and `read_full` are required. The default delta
/// encoding spends one bit to say "identical to the baseline" and otherwise
/// falls back to a full write.
pub trait NetState: Clone + Default + PartialEq + fmt::Debug + 'static {
    /// Write the full value.
    fn write_full(&self, writer: &mut BitWriter);

    /// Read a value written by [`NetState::write_full`].
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the stream is truncated or malformed.
    fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError>;

    /// Write the value, delta-encoded against `baseline` when one is given.
    fn net_serialize(&self, baseline: Option<&Self>, writer: &mut BitWriter) {
        if let Some(baseline) = baseline {
            let unchanged = baseline == self;
            writer.write_bit(unchanged);
            if unchanged {
                return;
            }
        }
        self.write_full(writer);
    }

    /// Read a value written by [`NetState::net_serialize`] with the same baseline.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the stream is truncated or malformed.
    fn net_deserialize(baseline: Option<&Self>, reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        if let Some(baseline) = baseline
            && reader.read_bit()?
        {
            return Ok(baseline.clone());
        }
        Self::read_full(reader)
    }

    /// Whether a locally predicted value differs enough from the authority's
    /// to require a rollback.
    fn should_reconcile(&self, authority: &Self) -> bool {
        self != authority
    }

    /// Blend between two values for presentation. Snaps to `to` by default.
    fn interpolate(_from: &Self, to: &Self, _pct: f32) -> Self {
        to.clone()
    }
}

impl NetState for () {
    fn write_full(&self, _writer: &mut BitWriter) {}

    fn read_full(_reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        Ok(())
    }

    fn net_serialize(&self, _baseline: Option<&Self>, _writer: &mut BitWriter) {}

    fn net_deserialize(_baseline: Option<&Self>, _reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        Ok(())
    }

    fn should_reconcile(&self, _authority: &Self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Simulation driver
// ---------------------------------------------------------------------------

/// Result of one simulation step.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput<S, A> {
    /// Sync state at the end of the step.
    pub sync: S,
    /// Aux state at the end of the step.
    pub aux: A,
    /// Events raised during the step.
    pub cues: Vec<NetCue>,
}

impl<S, A> TickOutput<S, A> {
    /// Output with no cues.
    pub fn new(sync: S, aux: A) -> Self {
        Self {
            sync,
            aux,
            cues: Vec::new(),
        }
    }
}

/// Where a dispatched cue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueOrigin {
    /// Raised by a local (predicted or authoritative) tick.
    Local,
    /// Received from the authority.
    Replicated,
}

/// Per-instance driver for one simulation type.
///
/// One value lives per registered instance. Optional hooks have no-op
/// defaults; `HAS_INPUT`/`HAS_SIMULATION` let a type opt out of whole
/// service groups.
pub trait Simulation: 'static {
    type Input: NetState;
    type Sync: NetState;
    type Aux: NetState;

    /// Human readable type name used in diagnostics.
    const NAME: &'static str;
    /// The simulation consumes input commands.
    const HAS_INPUT: bool = true;
    /// The simulation has a tick function (otherwise it is replicate-only).
    const HAS_SIMULATION: bool = true;

    /// State the instance starts with at its first frame.
    fn initial_state(&self) -> (Self::Sync, Self::Aux) {
        (Self::Sync::default(), Self::Aux::default())
    }

    /// Sample the local controller for the next frame.
    fn produce_input(&mut self, _delta_ms: i32) -> Self::Input {
        Self::Input::default()
    }

    /// Advance one step.
    fn simulation_tick(
        &mut self,
        step: &NetSimTimeStep,
        input: &Self::Input,
        sync: &Self::Sync,
        aux: &Self::Aux,
    ) -> TickOutput<Self::Sync, Self::Aux>;

    /// Push the newest state to the consumer (presentation, components...).
    fn finalize_frame(&mut self, _sync: &Self::Sync, _aux: &Self::Aux) {}

    /// Push a smoothed presentation state to the consumer.
    fn finalize_smoothing_frame(&mut self, sync: &Self::Sync, aux: &Self::Aux) {
        self.finalize_frame(sync, aux);
    }

    /// Reset any driver-side state to match a frame being resimulated from.
    fn restore_frame(&mut self, _sync: &Self::Sync, _aux: &Self::Aux) {}

    /// Pull results from the physics step into the sync state.
    fn post_physics(&mut self, _sync: &mut Self::Sync) {}

    /// React to a replicated or locally raised event.
    fn handle_cue(&mut self, _cue: &NetCue, _frame: i32, _origin: CueOrigin) {}
}

/// Which optional parts of the contract a simulation type provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Consumes input commands.
    pub has_input: bool,
    /// Has a tick function.
    pub has_simulation: bool,
}

impl Capabilities {
    /// Capabilities declared by `S`.
    pub fn of<S: Simulation>() -> Self {
        Self {
            has_input: S::HAS_INPUT,
            has_simulation: S::HAS_SIMULATION,
        }
    }
}

// ---------------------------------------------------------------------------
// Physics boundary
// ---------------------------------------------------------------------------

/// Optional physics world stepped alongside fixed-tick simulations.
///
/// The engine only needs step/save/restore; everything else about the
/// physics integration stays on the host side.
pub trait PhysicsWorld {
    /// Advance by `seconds`.
    fn step(&mut self, seconds: f32);

    /// Snapshot the world so `frame` can be restored later.
    fn save_state_for_frame(&mut self, frame: i32);

    /// Restore the snapshot saved for `frame` before resimulating from it.
    fn restore_state_for_frame(&mut self, frame: i32);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Small runtime id for a registered simulation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTypeId(pub u16);

impl fmt::Display for SimTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim#{}", self.0)
    }
}

/// Maps simulation types to [`SimTypeId`]s in registration order.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    ids: FxHashMap<TypeId, SimTypeId>,
    names: Vec<&'static str>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `S`, assigning the next one on first use.
    pub fn register<S: Simulation>(&mut self) -> SimTypeId {
        let next = SimTypeId(self.names.len() as u16);
        let names = &mut self.names;
        *self.ids.entry(TypeId::of::<S>()).or_insert_with(|| {
            names.push(S::NAME);
            next
        })
    }

    /// Id for `S` if it was registered.
    pub fn id_of<S: Simulation>(&self) -> Option<SimTypeId> {
        self.ids.get(&TypeId::of::<S>()).copied()
    }

    /// Diagnostic name of a registered type.
    pub fn name(&self, id: SimTypeId) -> Option<&'static str> {
        self.names.get(id.0 as usize).copied()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health(u16);

    impl NetState for Health {
        fn write_full(&self, writer: &mut BitWriter) {
            writer.write_u16(self.0);
        }

        fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
            Ok(Self(reader.read_u16()?))
        }
    }

    struct Idle;

    impl Simulation for Idle {
        type Input = ();
        type Sync = Health;
        type Aux = ();
        const NAME: &'static str = "Idle";
        const HAS_INPUT: bool = false;

        fn simulation_tick(
            &mut self,
            _step: &NetSimTimeStep,
            _input: &(),
            sync: &Health,
            _aux: &(),
        ) -> TickOutput<Health, ()> {
            TickOutput::new(sync.clone(), ())
        }
    }

    struct Other;

    impl Simulation for Other {
        type Input = ();
        type Sync = ();
        type Aux = ();
        const NAME: &'static str = "Other";

        fn simulation_tick(&mut self, _: &NetSimTimeStep, _: &(), _: &(), _: &()) -> TickOutput<(), ()> {
            TickOutput::new((), ())
        }
    }

    fn roundtrip(value: &Health, baseline: Option<&Health>) -> (Health, u32) {
        let mut writer = BitWriter::new();
        value.net_serialize(baseline, &mut writer);
        let bits = writer.bit_len();
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        (Health::net_deserialize(baseline, &mut reader).unwrap(), bits)
    }

    #[test]
    fn test_delta_against_identical_baseline_is_one_bit() {
        let (decoded, bits) = roundtrip(&Health(90), Some(&Health(90)));
        assert_eq!(decoded, Health(90));
        assert_eq!(bits, 1);
    }

    #[test]
    fn test_delta_against_changed_baseline_carries_full_value() {
        let (decoded, bits) = roundtrip(&Health(75), Some(&Health(90)));
        assert_eq!(decoded, Health(75));
        assert_eq!(bits, 17);

        let (decoded, bits) = roundtrip(&Health(75), None);
        assert_eq!(decoded, Health(75));
        assert_eq!(bits, 16);
    }

    #[test]
    fn test_unit_state_is_free() {
        let mut writer = BitWriter::new();
        ().net_serialize(Some(&()), &mut writer);
        assert!(writer.is_empty());
        assert!(!().should_reconcile(&()));
    }

    #[test]
    fn test_default_reconcile_and_interpolate() {
        assert!(Health(5).should_reconcile(&Health(7)));
        assert!(!Health(5).should_reconcile(&Health(5)));
        assert_eq!(Health::interpolate(&Health(0), &Health(10), 0.3), Health(10));
    }

    #[test]
    fn test_registry_assigns_stable_ids() {
        let mut registry = ModelRegistry::new();
        let idle = registry.register::<Idle>();
        let other = registry.register::<Other>();
        assert_eq!(registry.register::<Idle>(), idle);
        assert_ne!(idle, other);
        assert_eq!(registry.id_of::<Other>(), Some(other));
        assert_eq!(registry.name(idle), Some("Idle"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_capabilities_follow_consts() {
        let caps = Capabilities::of::<Idle>();
        assert!(!caps.has_input);
        assert!(caps.has_simulation);
        assert!(Capabilities::of::<Other>().has_input);
    }
}
