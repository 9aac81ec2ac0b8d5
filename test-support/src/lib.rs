pub mod fake_mailchannels;
pub mod fake_turnstile;

use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

pub fn setup_logging() {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}
