use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{info, warn};

use mesa::{
    ByteStream, Delivery, Frame, Message, MessageKind, Server, Transform, STEP_DURATION_US,
};

use crate::config::ServerConfig;
use crate::simulation::{apply_input, spawn_transform, MoveInput};

/// Request type answered with the requesting client's own id.
pub const CLIENT_INFO: u32 = 0;

/// Fixed-rate simulation loop: drain messages, integrate inputs, broadcast a
/// snapshot of every player each step.
pub struct GameServer {
    server: Server,
    config: ServerConfig,
    players: HashMap<u32, Transform>,
    pending_inputs: HashMap<u32, MoveInput>,
    started: Instant,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let mut server = Server::new();
        server.on(
            CLIENT_INFO,
            Box::new(|sender, _| {
                let mut stream = ByteStream::with_capacity(4);
                stream.write_u32(sender);
                stream.into_bytes()
            }),
        );
        server.start(config.port)?;

        Ok(Self {
            server,
            config,
            players: HashMap::new(),
            pending_inputs: HashMap::new(),
            started: Instant::now(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let step = Duration::from_micros(STEP_DURATION_US);
        info!("simulating at {} steps/sec", mesa::STEPS_PER_SEC);

        loop {
            let step_start = Instant::now();
            if let Some(run_for) = self.config.run_for {
                if step_start.duration_since(self.started) >= run_for {
                    break;
                }
            }

            self.step(step.as_secs_f32());

            let elapsed = step_start.elapsed();
            if elapsed < step {
                std::thread::sleep(step - elapsed);
            }
        }

        self.server.stop()?;
        Ok(())
    }

    fn step(&mut self, dt: f32) {
        for message in self.server.poll() {
            self.handle_message(message);
        }

        for (id, input) in self.pending_inputs.drain() {
            if let Some(transform) = self.players.get_mut(&id) {
                apply_input(transform, &input, self.config.move_speed, dt);
            }
        }

        self.broadcast_snapshot();
    }

    fn handle_message(&mut self, message: Message) {
        match message.kind {
            MessageKind::Connect => {
                info!("player {} joined", message.peer_id);
                self.players
                    .insert(message.peer_id, spawn_transform(message.peer_id));
            }
            MessageKind::Disconnect => {
                info!("player {} left", message.peer_id);
                self.players.remove(&message.peer_id);
                self.pending_inputs.remove(&message.peer_id);
            }
            MessageKind::Data => match MoveInput::decode(&message.payload) {
                Ok(input) => {
                    // latest input wins within a step
                    self.pending_inputs.insert(message.peer_id, input);
                }
                Err(e) => warn!("bad input from {}: {}", message.peer_id, e),
            },
            // requests are answered by the registered handlers
            MessageKind::DataRequest | MessageKind::DataResponse => {}
        }
    }

    fn broadcast_snapshot(&mut self) {
        if self.players.is_empty() {
            return;
        }
        let mut frame = Frame::new(self.started.elapsed().as_micros() as u64);
        for (&id, &transform) in &self.players {
            frame.entities.insert(id, transform);
        }
        if let Err(e) = self
            .server
            .broadcast(Delivery::Unreliable, frame.encode())
        {
            warn!("snapshot broadcast failed: {}", e);
        }
    }
}
