//! Demo simulation: a body steered across the XZ plane by a seeded bot.

use glam::Vec3;
use nebula_predict::{
    BitReader, BitWriter, CueOrigin, NetCue, NetSimTimeStep, NetState, Simulation, TickOutput, WireError,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tracing::debug;

/// Cue raised on the frame a body fires.
pub const FIRE_CUE: u16 = 1;

/// Movement speed in metres per second.
const SPEED: f32 = 4.0;

/// Frames a bot keeps one heading.
const TURN_INTERVAL: u32 = 45;

/// Positions closer than this are treated as equal when reconciling.
const POSITION_TOLERANCE: f32 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveInput {
    pub x: i8,
    pub z: i8,
    pub fire: bool,
}

impl NetState for MoveInput {
    fn write_full(&self, writer: &mut BitWriter) {
        writer.write_u8(self.x as u8);
        writer.write_u8(self.z as u8);
        writer.write_bit(self.fire);
    }

    fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            x: reader.read_u8()? as i8,
            z: reader.read_u8()? as i8,
            fire: reader.read_bit()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoverState {
    pub position: Vec3,
    pub velocity: Vec3,
}

fn write_vec3(writer: &mut BitWriter, v: Vec3) {
    writer.write_f32(v.x);
    writer.write_f32(v.y);
    writer.write_f32(v.z);
}

fn read_vec3(reader: &mut BitReader<'_>) -> Result<Vec3, WireError> {
    Ok(Vec3::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?))
}

impl NetState for MoverState {
    fn write_full(&self, writer: &mut BitWriter) {
        write_vec3(writer, self.position);
        write_vec3(writer, self.velocity);
    }

    fn read_full(reader: &mut BitReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            position: read_vec3(reader)?,
            velocity: read_vec3(reader)?,
        })
    }

    fn should_reconcile(&self, authority: &Self) -> bool {
        self.position.distance(authority.position) > POSITION_TOLERANCE
            || self.velocity.distance(authority.velocity) > POSITION_TOLERANCE
    }

    fn interpolate(from: &Self, to: &Self, pct: f32) -> Self {
        Self {
            position: from.position.lerp(to.position, pct),
            velocity: to.velocity,
        }
    }
}

/// Driver for one body. Bots sample their own input; remote copies only
/// simulate what they are given.
pub struct Mover {
    bot: Option<Xoshiro256StarStar>,
    heading: (i8, i8),
    frames_on_heading: u32,
    pub shots: u32,
}

impl Mover {
    pub fn bot(seed: u64) -> Self {
        Self {
            bot: Some(Xoshiro256StarStar::seed_from_u64(seed)),
            ..Self::remote()
        }
    }

    pub fn remote() -> Self {
        Self {
            bot: None,
            heading: (0, 0),
            frames_on_heading: 0,
            shots: 0,
        }
    }
}

impl Simulation for Mover {
    type Input = MoveInput;
    type Sync = MoverState;
    type Aux = ();
    const NAME: &'static str = "mover";

    fn produce_input(&mut self, _delta_ms: i32) -> MoveInput {
        let Some(rng) = self.bot.as_mut() else {
            return MoveInput::default();
        };
        if self.frames_on_heading == 0 {
            self.heading = (rng.gen_range(-1..=1), rng.gen_range(-1..=1));
            self.frames_on_heading = TURN_INTERVAL;
        }
        self.frames_on_heading -= 1;
        MoveInput {
            x: self.heading.0,
            z: self.heading.1,
            fire: rng.gen_bool(0.02),
        }
    }

    fn simulation_tick(
        &mut self,
        step: &NetSimTimeStep,
        input: &MoveInput,
        sync: &MoverState,
        _aux: &(),
    ) -> TickOutput<MoverState, ()> {
        let direction = Vec3::new(f32::from(input.x), 0.0, f32::from(input.z)).normalize_or_zero();
        let velocity = direction * SPEED;
        let seconds = step.step_ms as f32 / 1000.0;
        let mut output = TickOutput::new(
            MoverState {
                position: sync.position + velocity * seconds,
                velocity,
            },
            (),
        );
        if input.fire {
            output.cues.push(NetCue::signal(FIRE_CUE));
        }
        output
    }

    fn handle_cue(&mut self, cue: &NetCue, frame: i32, origin: CueOrigin) {
        if cue.kind == FIRE_CUE {
            self.shots += 1;
            debug!(frame, ?origin, "Shot fired");
        }
    }
}
