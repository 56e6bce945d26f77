use chrono::Utc;
use log::info;
use std::io::Write;

/// Logger bootstrap for the realtime client.
pub struct StreamLogger;

impl StreamLogger {
    /// Installs env_logger with `default_level` as filter unless `RUST_LOG`
    /// overrides it. A second call is a no-op.
    pub fn init(default_level: &str) -> bool {
        let env = env_logger::Env::default().default_filter_or(default_level);
        let installed = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{}] [{}] [{}:{}] {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                    record.level(),
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .try_init()
            .is_ok();

        if installed {
            info!("Realtime client logger initialized");
        }
        installed
    }
}
