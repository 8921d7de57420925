use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use glam::Vec3;
use log::{info, warn};

use mesa::{
    interpolate, ByteStream, Client, Delivery, Frame, FrameBuffer, MessageKind, NetError, Sample,
};

/// Request type answered with the requesting client's own id.
const CLIENT_INFO: u32 = 0;

/// Delay between reconnection attempts, doubled each failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(16);
const INPUT_INTERVAL: Duration = Duration::from_millis(100);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// A connected session: polls frames into the interpolation buffer, samples
/// it on a render clock anchored to the server's snapshot timestamps, and
/// sends a wandering movement input.
pub struct Session {
    client: Client,
    host: String,
    port: u16,
    retries: u32,
    run_for: Option<Duration>,
    my_id: Option<u32>,
    buffer: FrameBuffer,
    /// (local receive instant, frame timestamp) of the newest frame; maps
    /// local elapsed time onto the server's snapshot clock.
    clock: Option<(Instant, u64)>,
}

impl Session {
    pub fn new(host: String, port: u16, retries: u32, run_for: Option<Duration>) -> Result<Self> {
        Ok(Self {
            client: Client::new()?,
            host,
            port,
            retries,
            run_for,
            my_id: None,
            buffer: FrameBuffer::new(),
            clock: None,
        })
    }

    fn connect_with_retry(&mut self) -> Result<()> {
        let mut backoff = RETRY_BACKOFF;
        for attempt in 1..=self.retries {
            match self.client.connect(&self.host, self.port) {
                Ok(()) => {
                    let response = self.client.request(CLIENT_INFO, &[])?;
                    let id = parse_client_id(&response.payload)?;
                    info!("joined as player {}", id);
                    self.my_id = Some(id);
                    self.buffer.clear();
                    self.clock = None;
                    return Ok(());
                }
                Err(NetError::ConnectTimeout) => {
                    warn!(
                        "connection attempt {}/{} timed out, retrying in {:?}",
                        attempt, self.retries, backoff
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("could not reach {}:{}", self.host, self.port);
    }

    pub fn run(&mut self) -> Result<()> {
        self.connect_with_retry()?;

        let started = Instant::now();
        let mut last_input = Instant::now();
        let mut last_report = Instant::now();

        loop {
            if let Some(run_for) = self.run_for {
                if started.elapsed() >= run_for {
                    break;
                }
            }

            let mut lost_connection = false;
            for message in self.client.poll() {
                match message.kind {
                    MessageKind::Data => {
                        let mut stream = ByteStream::from_bytes(message.payload);
                        match Frame::decode(&mut stream) {
                            Ok(frame) => self.accept_frame(frame),
                            Err(e) => warn!("undecodable snapshot: {}", e),
                        }
                    }
                    MessageKind::Disconnect => {
                        warn!("server dropped the connection");
                        lost_connection = true;
                    }
                    _ => {}
                }
            }

            if lost_connection {
                self.connect_with_retry()?;
                continue;
            }

            if last_input.elapsed() >= INPUT_INTERVAL {
                last_input = Instant::now();
                self.send_input(started.elapsed().as_secs_f32())?;
            }

            if let Some(now_us) = self.render_time() {
                let report_due = last_report.elapsed() >= REPORT_INTERVAL;
                match self.buffer.sample(now_us) {
                    Sample::Ready { from, to, t } => {
                        if report_due {
                            let frame = interpolate(from, to, t);
                            last_report = Instant::now();
                            report(&frame, self.my_id);
                        }
                    }
                    Sample::Stale(frame) => {
                        if report_due {
                            last_report = Instant::now();
                            warn!("snapshot stream stalled at {}", frame.timestamp);
                        }
                    }
                    Sample::NotReady => {}
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        self.client.disconnect()?;
        Ok(())
    }

    fn accept_frame(&mut self, frame: Frame) {
        if self
            .buffer
            .latest()
            .is_none_or(|latest| frame.timestamp > latest.timestamp)
        {
            self.clock = Some((Instant::now(), frame.timestamp));
        }
        self.buffer.push(frame);
    }

    /// Current position on the server's snapshot timeline.
    fn render_time(&self) -> Option<u64> {
        let (anchor, timestamp) = self.clock?;
        Some(timestamp + anchor.elapsed().as_micros() as u64)
    }

    /// Walk a slow circle so the server has something to integrate.
    fn send_input(&mut self, elapsed_secs: f32) -> Result<()> {
        let angle = elapsed_secs * 0.5;
        let mut stream = ByteStream::with_capacity(16);
        stream.write_vec3(Vec3::new(angle.cos(), 0.0, angle.sin()));
        stream.write_f32(angle);
        self.client.send(Delivery::Reliable, stream.into_bytes())?;
        Ok(())
    }
}

/// A malformed CLIENT_INFO response is a protocol violation worth failing
/// the session over, unlike the per-snapshot decode failures that are only
/// logged.
fn parse_client_id(payload: &[u8]) -> Result<u32, NetError> {
    let mut stream = ByteStream::from(payload);
    Ok(stream.read_u32()?)
}

fn report(frame: &Frame, my_id: Option<u32>) {
    let me = my_id.and_then(|id| frame.entities.get(&id));
    match me {
        Some(transform) => info!(
            "{} players, at ({:.2}, {:.2}, {:.2})",
            frame.entities.len(),
            transform.position.x,
            transform.position.y,
            transform.position.z
        ),
        None => info!("{} players visible", frame.entities.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_parses() {
        assert_eq!(parse_client_id(&[0, 0, 0, 7]).unwrap(), 7);
    }

    #[test]
    fn truncated_client_id_is_a_decode_error() {
        assert!(matches!(
            parse_client_id(&[0, 1]),
            Err(NetError::Decode(_))
        ));
    }
}
