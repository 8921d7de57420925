use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub move_speed: f32,
    /// None runs until killed.
    pub run_for: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: mesa::DEFAULT_PORT,
            move_speed: 5.0,
            run_for: None,
        }
    }
}
