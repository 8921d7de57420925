use glam::{Quat, Vec3};

use mesa::{ByteStream, DecodeError, Transform};

/// A movement input as sent by clients: a direction vector and a yaw angle.
#[derive(Debug, Clone, Copy)]
pub struct MoveInput {
    pub direction: Vec3,
    pub yaw: f32,
}

impl MoveInput {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut stream = ByteStream::from(payload);
        Ok(Self {
            direction: stream.read_vec3()?,
            yaw: stream.read_f32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = ByteStream::with_capacity(16);
        stream.write_vec3(self.direction);
        stream.write_f32(self.yaw);
        stream.into_bytes()
    }
}

/// Integrates one movement input into a player transform.
pub fn apply_input(transform: &mut Transform, input: &MoveInput, speed: f32, dt: f32) {
    if input.direction.length_squared() > 0.001 {
        let dir = input.direction.normalize();
        transform.position += dir * speed * dt;
    }
    transform.rotation = Quat::from_rotation_y(input.yaw);
}

/// Spawn positions fan out on a circle so players do not stack.
pub fn spawn_transform(client_id: u32) -> Transform {
    let angle = (client_id % 16) as f32 * (std::f32::consts::TAU / 16.0);
    Transform {
        position: Vec3::new(angle.cos() * 5.0, 0.0, angle.sin() * 5.0),
        rotation: Quat::IDENTITY,
    }
}
