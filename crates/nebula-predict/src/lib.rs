//! Client prediction and rollback: fixed and independent tick clocks,
//! per-instance frame buffers, state replication, reconciliation against the
//! authority, observer interpolation, lag compensation and replays.

pub mod bits;
pub mod connection;
pub mod cues;
pub mod error;
pub mod frame_buffer;
pub mod instance;
pub mod lag_compensation;
pub mod model;
pub mod replay;
pub mod replication;
pub mod services;
pub mod store;
pub mod tick;
pub mod view;
pub mod world;

/// Sentinel for "no frame".
pub const INDEX_NONE: i32 = -1;

pub use bits::{BitReader, BitWriter};
pub use cues::{CueHistory, NetCue};
pub use error::{PredictionError, ReplayError, WireError};
pub use frame_buffer::{FrameBuffer, FrameRecord};
pub use instance::{ConnectionId, InstanceConfig, InstanceId, NetRole, NetworkLod, TickingPolicy};
pub use lag_compensation::{
    LagCompId, LagCompensationHistory, LagCompensationLimits, LagCompensationManager, LagCompensationSample,
    RewindTarget,
};
pub use model::{CueOrigin, ModelRegistry, NetState, PhysicsWorld, SimTypeId, Simulation, TickOutput};
pub use replay::{ReplayFile, ReplayFrame, ReplayRecorder, load_replay, write_replay};
pub use replication::{AckedFramesRpc, InputRpc, RecvOutcome, ReplicationTarget, decode_rpc, encode_rpc};
pub use store::{InstanceData, Record};
pub use tick::NetSimTimeStep;
pub use view::{FrameHandle, InstanceView, ViewSlot};
pub use world::{FrameReport, PredictionWorld, ReconcileOutcome};
