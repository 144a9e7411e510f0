use log::*;
use std::{fs::File, path::Path, sync::Once};

static INIT_LOGGING_ENTRY_POINT: Once = Once::new();

// The module can be attached more than once per process (for example through several proxy
// libraries), logging must be initialized only the first time.
pub fn init_logging(log_path: &Path) {
    INIT_LOGGING_ENTRY_POINT.call_once(|| {
        let log_file = match File::create(log_path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Cannot open {}: {}", log_path.display(), e);
                return;
            }
        };

        let res = if cfg!(debug_assertions) {
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}] At {}:{}:\n{}",
                        chrono::Local::now().format("%H:%M:%S.%f"),
                        record.level(),
                        record.file().unwrap_or("?"),
                        record.line().unwrap_or(0),
                        message
                    ))
                })
                .level(LevelFilter::Trace)
                .chain(std::io::stdout())
        } else {
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%H:%M:%S.%f"),
                        record.level(),
                        message
                    ))
                })
                .level(LevelFilter::Info)
        }
        .chain(log_file)
        .apply();

        if let Err(e) = res {
            eprintln!("Logger already set: {}", e);
            return;
        }

        // the message is already logged, make sure it reaches the file before a possible crash
        fn log_error_fn(_: &str) {
            log::logger().flush();
        }

        vrfx_common::logging::set_show_error_fn(log_error_fn);
    });
}
