use std::collections::{BTreeMap, VecDeque};

use glam::{Quat, Vec3};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{ByteStream, DecodeError};

pub const STEPS_PER_SEC: u64 = 10;
pub const STEP_DURATION_US: u64 = 1_000_000 / STEPS_PER_SEC;

/// How far behind the newest snapshot the presented state runs. Three steps
/// of slack rides out one lost snapshot plus jitter.
pub const INTERPOLATION_DELAY_US: u64 = 3 * STEP_DURATION_US;

/// Pose of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Transform {
    pub fn write(&self, stream: &mut ByteStream) {
        stream.write_vec3(self.position);
        stream.write_quat(self.rotation);
    }

    pub fn read(stream: &mut ByteStream) -> Result<Self, DecodeError> {
        Ok(Self {
            position: stream.read_vec3()?,
            rotation: stream.read_quat()?,
        })
    }

    /// Blends two poses: linear for position, shortest-arc spherical for
    /// rotation.
    pub fn lerp(&self, other: &Transform, t: f32) -> Transform {
        Transform {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t).normalize(),
        }
    }
}

/// One world snapshot: every replicated entity's pose at a single instant.
/// Timestamps are microseconds on the sender's monotonic clock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub timestamp: u64,
    pub entities: BTreeMap<u32, Transform>,
}

impl Frame {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            entities: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = ByteStream::with_capacity(12 + self.entities.len() * 32);
        stream.write_u64(self.timestamp);
        stream.write_u32(self.entities.len() as u32);
        for (&id, transform) in &self.entities {
            stream.write_u32(id);
            transform.write(&mut stream);
        }
        stream.into_bytes()
    }

    pub fn decode(stream: &mut ByteStream) -> Result<Self, DecodeError> {
        let timestamp = stream.read_u64()?;
        let count = stream.read_u32()?;
        let mut entities = BTreeMap::new();
        for _ in 0..count {
            let id = stream.read_u32()?;
            entities.insert(id, Transform::read(stream)?);
        }
        Ok(Self {
            timestamp,
            entities,
        })
    }
}

/// Blends two frames at parameter `t` (0 = `from`, 1 = `to`).
///
/// Entities present only in `to` appear at their new pose; entities present
/// only in `from` are held at their last known pose rather than vanishing for
/// the duration of the blend.
pub fn interpolate(from: &Frame, to: &Frame, t: f32) -> Frame {
    let mut entities = BTreeMap::new();
    for (&id, a) in &from.entities {
        match to.entities.get(&id) {
            Some(b) => {
                entities.insert(id, a.lerp(b, t));
            }
            None => {
                entities.insert(id, *a);
            }
        }
    }
    for (&id, b) in &to.entities {
        entities.entry(id).or_insert(*b);
    }
    Frame {
        timestamp: from.timestamp + ((to.timestamp - from.timestamp) as f32 * t) as u64,
        entities,
    }
}

/// Result of sampling the buffer at a render instant.
#[derive(Debug, PartialEq)]
pub enum Sample<'a> {
    /// Two frames bracket the delayed render time; blend them at `t`.
    Ready {
        from: &'a Frame,
        to: &'a Frame,
        t: f32,
    },
    /// Not enough history yet; show nothing.
    NotReady,
    /// The stream stalled and the render time ran past the newest frame;
    /// hold it as-is. Never extrapolates.
    Stale(&'a Frame),
}

/// Timestamp-ordered snapshot history, newest first, sampled a fixed delay
/// behind real time so there is almost always a pair of frames to blend.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    delay: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_delay(INTERPOLATION_DELAY_US)
    }

    pub fn with_delay(delay_us: u64) -> Self {
        Self {
            frames: VecDeque::new(),
            delay: delay_us,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.front()
    }

    /// Inserts a frame in timestamp order. Frames may arrive out of order
    /// off the unreliable channel; a duplicate timestamp is dropped.
    pub fn push(&mut self, frame: Frame) {
        let mut index = self.frames.len();
        for (i, existing) in self.frames.iter().enumerate() {
            if existing.timestamp == frame.timestamp {
                debug!("dropping duplicate snapshot at {}", frame.timestamp);
                return;
            }
            if existing.timestamp < frame.timestamp {
                index = i;
                break;
            }
        }
        self.frames.insert(index, frame);
    }

    /// Picks the pair of frames bracketing `now - delay` and the blend
    /// parameter between them, pruning history older than the bracket.
    pub fn sample(&mut self, now: u64) -> Sample<'_> {
        if self.frames.len() < 2 {
            return Sample::NotReady;
        }
        let delayed = now.saturating_sub(self.delay);
        let last = self.frames.len() - 1;

        let mut from_index = last;
        for (i, frame) in self.frames.iter().enumerate() {
            if frame.timestamp < delayed {
                from_index = i;
                break;
            }
        }
        let mut to_index = 0;
        for i in (0..self.frames.len()).rev() {
            if self.frames[i].timestamp >= delayed {
                to_index = i;
                break;
            }
        }

        if from_index == to_index {
            if to_index == 0 {
                // every frame is older than the delayed time
                return Sample::Stale(&self.frames[0]);
            }
            // every frame is newer than the delayed time
            return Sample::NotReady;
        }

        // frames older than the bracket will never be sampled again
        self.frames.truncate(from_index + 1);

        let from = &self.frames[from_index];
        let to = &self.frames[to_index];
        let span = to.timestamp - from.timestamp;
        let t = ((delayed - from.timestamp) as f32 / span as f32).clamp(0.0, 1.0);
        Sample::Ready { from, to, t }
    }
}
