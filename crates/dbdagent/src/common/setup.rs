use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;

/// Crates whose debug output is enabled by `verbose`.
const OWN_TARGETS: [&str; 3] = ["dbdagent", "dbd_replay", "jobres"];

/// Initializes the global logger. `RUST_LOG` overrides the levels chosen here.
///
/// `verbose` turns on debug messages of the accounting crates only, dependencies stay at info.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(LevelFilter::Info);
    if verbose {
        for target in OWN_TARGETS {
            builder.filter_module(target, LevelFilter::Debug);
        }
    }

    let env_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug") || v.contains("trace"))
        .unwrap_or(false);

    if verbose || env_debug {
        builder.format_timestamp_millis().format_target(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{:<5}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
