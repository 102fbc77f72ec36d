//! Error types for registration, the wire layer and replay files.

use crate::instance::InstanceId;

/// Errors reported when registering or configuring instances.
///
/// A failed registration leaves the instance inert; nothing else in the
/// world is affected.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    /// The instance id is already registered.
    #[error("instance {0} is already registered")]
    DuplicateInstance(InstanceId),

    /// No instance with this id is registered.
    #[error("instance {0} is not registered")]
    UnknownInstance(InstanceId),

    /// The instance exists but under a different simulation type.
    #[error("instance {id} is registered as `{registered}`, not `{requested}`")]
    SimTypeMismatch {
        /// Instance that was looked up.
        id: InstanceId,
        /// Simulation type it was registered with.
        registered: &'static str,
        /// Simulation type the caller asked for.
        requested: &'static str,
    },

    /// Only provisional (negative) ids can be remapped, and only once.
    #[error("instance {0} cannot be remapped (not provisional or already remapped)")]
    AlreadyRemapped(InstanceId),

    /// The authoritative id handed to a remap is not positive.
    #[error("remap target {0} is not a valid authoritative id")]
    InvalidRemapTarget(InstanceId),

    /// Role/policy combination the simulation cannot support.
    #[error("invalid registration for `{sim}`: {reason}")]
    InvalidRegistration {
        /// Simulation type name.
        sim: &'static str,
        /// Why the registration was refused.
        reason: String,
    },

    /// The supplied configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] nebula_config::ConfigError),
}

/// Errors raised while reading or writing replicated payloads.
///
/// These never escape an instance: the world logs them and discards the
/// payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Attempted to read past the end of the stream.
    #[error("bit stream overrun: wanted {wanted} bits, {remaining} remaining")]
    Overrun {
        /// Bits the read required.
        wanted: u32,
        /// Bits left in the stream.
        remaining: u32,
    },

    /// A decoded value is outside its legal range.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The instance's ticking policy does not use this replication target.
    #[error("instance {id} does not replicate to {target}")]
    UnsupportedTarget {
        /// Instance the payload was for.
        id: InstanceId,
        /// Target name.
        target: &'static str,
    },

    /// Serde payload could not be encoded or decoded.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    /// The payload targets an instance this world does not know.
    #[error(transparent)]
    Registration(#[from] PredictionError),
}

/// Errors from reading or writing replay recordings.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The file was produced by a newer format than this build understands.
    #[error("replay version {found} is newer than supported version {max_supported}")]
    VersionTooNew {
        /// Version found in the file header.
        found: u32,
        /// Highest version this build can read.
        max_supported: u32,
    },

    /// Underlying I/O failure.
    #[error("replay I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Compression or serialization failure.
    #[error("replay serialization error: {0}")]
    Serialization(String),
}
