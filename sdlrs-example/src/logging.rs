use std::path::Path;

pub fn setup_logger(level: log::LevelFilter, log_file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                std::thread::current().name().unwrap_or("-"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());
    if let Some(log_file) = log_file {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }
    dispatch.apply()?;
    Ok(())
}
